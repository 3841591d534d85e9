use super::species::{ELEMENTS, element_index, species};
use num_dual::DualNum;
use phf::{Map, phf_map};

pub const GAS_CONSTANT: f64 = 8.314_462_618;
pub const REFERENCE_TEMPERATURE: f64 = 298.15;

/// Dissolution data for a mineral phase.
///
/// The ion activity product is `Π a_i^ν_i · a_w^water · a_H+^proton`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MineralData {
    pub log_k25: f64,
    /// Reaction enthalpy in J/mol.
    pub delta_h: f64,
    pub molar_mass: f64,
    pub ions: &'static [(&'static str, f64)],
    pub water: f64,
    pub proton: f64,
}

pub static MINERALS: Map<&'static str, MineralData> = phf_map! {
    "Calcite" => MineralData {
        log_k25: -8.48, delta_h: -9.61e3, molar_mass: 100.087,
        ions: &[("Ca+2", 1.0), ("CO3-2", 1.0)], water: 0.0, proton: 0.0,
    },
    "Aragonite" => MineralData {
        log_k25: -8.336, delta_h: -10.83e3, molar_mass: 100.087,
        ions: &[("Ca+2", 1.0), ("CO3-2", 1.0)], water: 0.0, proton: 0.0,
    },
    "Gypsum" => MineralData {
        log_k25: -4.58, delta_h: -0.456e3, molar_mass: 172.17,
        ions: &[("Ca+2", 1.0), ("SO4-2", 1.0)], water: 2.0, proton: 0.0,
    },
    "Anhydrite" => MineralData {
        log_k25: -4.36, delta_h: -7.15e3, molar_mass: 136.14,
        ions: &[("Ca+2", 1.0), ("SO4-2", 1.0)], water: 0.0, proton: 0.0,
    },
    "Halite" => MineralData {
        log_k25: 1.570, delta_h: 5.73e3, molar_mass: 58.443,
        ions: &[("Na+", 1.0), ("Cl-", 1.0)], water: 0.0, proton: 0.0,
    },
    "Brucite" => MineralData {
        log_k25: 16.84, delta_h: -108.1e3, molar_mass: 58.32,
        ions: &[("Mg+2", 1.0)], water: 2.0, proton: -2.0,
    },
    "Celestite" => MineralData {
        log_k25: -6.63, delta_h: -4.34e3, molar_mass: 183.68,
        ions: &[("Sr+2", 1.0), ("SO4-2", 1.0)], water: 0.0, proton: 0.0,
    },
};

pub fn mineral(name: &str) -> Option<&'static MineralData> {
    MINERALS.get(name)
}

/// Van 't Hoff extrapolation of a 25 °C equilibrium constant.
pub fn log_k_at<D: DualNum<f64> + Copy>(log_k25: f64, delta_h: f64, temperature: D) -> D {
    let slope = delta_h / (GAS_CONSTANT * std::f64::consts::LN_10);
    -(temperature.recip() - 1.0 / REFERENCE_TEMPERATURE) * slope + log_k25
}

impl MineralData {
    /// Moles of each tracked element removed from solution per mole of mineral.
    pub fn element_stoichiometry(&self) -> [f64; ELEMENTS.len()] {
        let mut row = [0.0; ELEMENTS.len()];
        for (ion, nu) in self.ions {
            if let Some(data) = species(ion) {
                for (element, count) in data.elements {
                    if let Some(idx) = element_index(element) {
                        row[idx] += nu * count;
                    }
                }
            }
        }
        row
    }
}
