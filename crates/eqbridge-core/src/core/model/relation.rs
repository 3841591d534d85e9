use super::ids::VarId;
use std::fmt;

pub type ResidualFn = Box<dyn Fn(&[f64]) -> f64 + Send + Sync>;

pub enum RelationKind {
    /// `Σ c_i · x_i + constant = 0`
    Linear {
        terms: Vec<(VarId, f64)>,
        constant: f64,
    },
    /// `f(x_1, .., x_n) = 0` over the listed variables, in order.
    Expression {
        variables: Vec<VarId>,
        residual: ResidualFn,
    },
}

/// An algebraic equality constraint of the host model.
///
/// The stored residual is multiplied by `scaling` before the solver sees it.
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub scaling: f64,
}

impl Relation {
    pub fn linear(name: impl Into<String>, terms: Vec<(VarId, f64)>, constant: f64) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::Linear { terms, constant },
            scaling: 1.0,
        }
    }

    pub fn expression<F>(name: impl Into<String>, variables: Vec<VarId>, residual: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: RelationKind::Expression {
                variables,
                residual: Box::new(residual),
            },
            scaling: 1.0,
        }
    }

    pub fn with_scaling(mut self, scaling: f64) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn variables(&self) -> Vec<VarId> {
        match &self.kind {
            RelationKind::Linear { terms, .. } => terms.iter().map(|(id, _)| *id).collect(),
            RelationKind::Expression { variables, .. } => variables.clone(),
        }
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Relation");
        s.field("name", &self.name).field("scaling", &self.scaling);
        match &self.kind {
            RelationKind::Linear { terms, constant } => {
                s.field("terms", terms).field("constant", constant);
            }
            RelationKind::Expression { variables, .. } => {
                s.field("variables", variables);
            }
        }
        s.finish()
    }
}
