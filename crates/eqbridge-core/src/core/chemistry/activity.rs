use super::ChemistryError;
use crate::core::units::ZERO_CELSIUS_K;
use num_dual::DualNum;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityModel {
    Ideal,
    /// Debye-Hückel limiting law.
    DebyeHuckel,
    #[default]
    Davies,
}

impl ActivityModel {
    /// `log10` of the activity coefficient of an ion of charge `charge`.
    ///
    /// Neutral species are treated as ideal in every model.
    pub fn log10_gamma<D: DualNum<f64> + Copy>(&self, charge: i8, ionic_strength: D, temperature: D) -> D {
        if charge == 0 {
            return D::from(0.0);
        }
        let z2 = f64::from(charge * charge);
        let sqrt_i = if ionic_strength.re() > 0.0 {
            ionic_strength.sqrt()
        } else {
            D::from(0.0)
        };
        match self {
            ActivityModel::Ideal => D::from(0.0),
            ActivityModel::DebyeHuckel => -debye_huckel_a(temperature) * sqrt_i * z2,
            ActivityModel::Davies => {
                let shape = sqrt_i / (sqrt_i + 1.0) - ionic_strength * 0.3;
                -debye_huckel_a(temperature) * shape * z2
            }
        }
    }
}

/// Debye-Hückel `A` parameter in (kg/mol)^½, fitted over 0-100 °C.
pub fn debye_huckel_a<D: DualNum<f64> + Copy>(temperature: D) -> D {
    let t = temperature - ZERO_CELSIUS_K;
    t * t * 5.95e-6 + t * 6.08e-4 + 0.4913
}

impl FromStr for ActivityModel {
    type Err = ChemistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ideal" | "ActivityModelIdealAqueous" => Ok(ActivityModel::Ideal),
            "debye-huckel" | "ActivityModelDebyeHuckel" => Ok(ActivityModel::DebyeHuckel),
            "davies" | "ActivityModelDavies" => Ok(ActivityModel::Davies),
            other => Err(ChemistryError::UnknownActivityModel(other.to_string())),
        }
    }
}

impl fmt::Display for ActivityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityModel::Ideal => write!(f, "ideal"),
            ActivityModel::DebyeHuckel => write!(f, "debye-huckel"),
            ActivityModel::Davies => write!(f, "davies"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_dual::Dual64;

    #[test]
    fn debye_huckel_a_is_close_to_textbook_value_at_25c() {
        assert_relative_eq!(debye_huckel_a(298.15), 0.5102, epsilon = 1e-3);
    }

    #[test]
    fn ideal_model_has_unit_activity() {
        assert_eq!(ActivityModel::Ideal.log10_gamma(2, 0.7, 298.15), 0.0);
    }

    #[test]
    fn davies_lowers_divalent_activity_in_seawater() {
        let lg1 = ActivityModel::Davies.log10_gamma(1, 0.7, 293.15);
        let lg2 = ActivityModel::Davies.log10_gamma(2, 0.7, 293.15);
        assert!(lg1 < 0.0);
        assert_relative_eq!(lg2, 4.0 * lg1, epsilon = 1e-12);
    }

    #[test]
    fn zero_ionic_strength_has_finite_derivative() {
        let i = Dual64::new(0.0, 1.0);
        let lg = ActivityModel::Davies.log10_gamma(1, i, Dual64::from(298.15));
        assert!(lg.eps.is_finite());
    }

    #[test]
    fn davies_derivative_matches_finite_difference() {
        let t = Dual64::from(298.15);
        let lg = ActivityModel::Davies.log10_gamma(2, Dual64::new(0.5, 1.0), t);
        let h = 1e-6;
        let fd = (ActivityModel::Davies.log10_gamma(2, 0.5 + h, 298.15)
            - ActivityModel::Davies.log10_gamma(2, 0.5 - h, 298.15))
            / (2.0 * h);
        assert_relative_eq!(lg.eps, fd, epsilon = 1e-7);
    }

    #[test]
    fn parses_model_names() {
        assert_eq!("davies".parse::<ActivityModel>().unwrap(), ActivityModel::Davies);
        assert_eq!(
            "ActivityModelDebyeHuckel".parse::<ActivityModel>().unwrap(),
            ActivityModel::DebyeHuckel
        );
        assert!(matches!(
            "pitzer".parse::<ActivityModel>(),
            Err(ChemistryError::UnknownActivityModel(_))
        ));
    }

    #[test]
    fn pitzer_configuration_name_is_rejected() {
        assert_eq!(
            "ActivityModelPitzer".parse::<ActivityModel>(),
            Err(ChemistryError::UnknownActivityModel("ActivityModelPitzer".to_string()))
        );
    }
}
