/// A scalar unknown (or parameter, when fixed) of the host model.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: f64,
    pub fixed: bool,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            fixed: false,
            lower: None,
            upper: None,
        }
    }

    /// Creates a variable that the solver treats as a constant.
    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self {
            fixed: true,
            ..Self::new(name, value)
        }
    }

    pub fn with_bounds(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn non_negative(self) -> Self {
        let upper = self.upper;
        self.with_bounds(Some(0.0), upper)
    }

    pub fn within_bounds(&self, value: f64) -> bool {
        self.lower.is_none_or(|lo| value >= lo) && self.upper.is_none_or(|hi| value <= hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_constructor_marks_variable_fixed() {
        let v = Variable::fixed("T", 293.0);
        assert!(v.fixed);
        assert_eq!(v.value, 293.0);
    }

    #[test]
    fn bounds_are_checked_inclusively() {
        let v = Variable::new("x", 1.0).with_bounds(Some(0.0), Some(2.0));
        assert!(v.within_bounds(0.0));
        assert!(v.within_bounds(2.0));
        assert!(!v.within_bounds(-1e-9));
        assert!(Variable::new("y", 0.0).non_negative().within_bounds(5.0e9));
    }

    #[test]
    fn non_negative_keeps_existing_upper_bound() {
        let v = Variable::new("x", 1.0)
            .with_bounds(None, Some(5.0))
            .non_negative();
        assert_eq!(v.lower, Some(0.0));
        assert_eq!(v.upper, Some(5.0));
        assert!(!v.within_bounds(-1.0));
        assert!(!v.within_bounds(6.0));
    }
}
