use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const STANDARD_PRESSURE_PA: f64 = 101_325.0;
pub const ZERO_CELSIUS_K: f64 = 273.15;
pub const WATER_MOLAR_MASS: f64 = 18.015;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("Unknown {kind} unit '{unit}'")]
pub struct UnitParseError {
    pub kind: &'static str,
    pub unit: String,
}

/// An affine map `native = scale * host + offset` from a host quantity to the
/// oracle's native unit system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitMap {
    pub scale: f64,
    pub offset: f64,
}

impl UnitMap {
    pub const IDENTITY: UnitMap = UnitMap {
        scale: 1.0,
        offset: 0.0,
    };

    pub fn linear(scale: f64) -> Self {
        Self { scale, offset: 0.0 }
    }

    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        self.scale * value + self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemperatureUnit {
    #[default]
    Kelvin,
    Celsius,
}

impl TemperatureUnit {
    pub fn to_kelvin(&self) -> UnitMap {
        match self {
            TemperatureUnit::Kelvin => UnitMap::IDENTITY,
            TemperatureUnit::Celsius => UnitMap {
                scale: 1.0,
                offset: ZERO_CELSIUS_K,
            },
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "K" | "kelvin" => Ok(TemperatureUnit::Kelvin),
            "degC" | "C" | "celsius" => Ok(TemperatureUnit::Celsius),
            other => Err(UnitParseError {
                kind: "temperature",
                unit: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureUnit {
    #[default]
    Pascal,
    KiloPascal,
    Bar,
    Atmosphere,
}

impl PressureUnit {
    pub fn to_pascal(&self) -> UnitMap {
        match self {
            PressureUnit::Pascal => UnitMap::IDENTITY,
            PressureUnit::KiloPascal => UnitMap::linear(1.0e3),
            PressureUnit::Bar => UnitMap::linear(1.0e5),
            PressureUnit::Atmosphere => UnitMap::linear(STANDARD_PRESSURE_PA),
        }
    }
}

impl FromStr for PressureUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Pa" => Ok(PressureUnit::Pascal),
            "kPa" => Ok(PressureUnit::KiloPascal),
            "bar" => Ok(PressureUnit::Bar),
            "atm" => Ok(PressureUnit::Atmosphere),
            other => Err(UnitParseError {
                kind: "pressure",
                unit: other.to_string(),
            }),
        }
    }
}

/// Whether a composition quantity is a flow (per second) or a concentration
/// (per litre of solution).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionBasis {
    MassFlow,
    Concentration,
}

/// Units accepted for per-species composition values.
///
/// Flow units are evaluated over one second of flow and concentration units
/// over one litre of solution, so the oracle always receives absolute amounts
/// (kg of solvent, mol of solute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmountUnit {
    #[default]
    KilogramPerSecond,
    GramPerSecond,
    MolePerSecond,
    MilligramPerLitre,
    GramPerLitre,
    MolePerLitre,
}

impl AmountUnit {
    pub fn basis(&self) -> CompositionBasis {
        match self {
            AmountUnit::KilogramPerSecond | AmountUnit::GramPerSecond | AmountUnit::MolePerSecond => {
                CompositionBasis::MassFlow
            }
            AmountUnit::MilligramPerLitre | AmountUnit::GramPerLitre | AmountUnit::MolePerLitre => {
                CompositionBasis::Concentration
            }
        }
    }

    /// Moles of a substance of molar mass `molar_mass` (g/mol) per one unit.
    pub fn moles_per_unit(&self, molar_mass: f64) -> f64 {
        match self {
            AmountUnit::KilogramPerSecond => 1.0e3 / molar_mass,
            AmountUnit::GramPerSecond | AmountUnit::GramPerLitre => 1.0 / molar_mass,
            AmountUnit::MilligramPerLitre => 1.0e-3 / molar_mass,
            AmountUnit::MolePerSecond | AmountUnit::MolePerLitre => 1.0,
        }
    }

    /// Kilograms of a substance of molar mass `molar_mass` (g/mol) per one unit.
    pub fn kilograms_per_unit(&self, molar_mass: f64) -> f64 {
        self.moles_per_unit(molar_mass) * molar_mass * 1.0e-3
    }
}

impl FromStr for AmountUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "kg/s" => Ok(AmountUnit::KilogramPerSecond),
            "g/s" => Ok(AmountUnit::GramPerSecond),
            "mol/s" => Ok(AmountUnit::MolePerSecond),
            "mg/L" => Ok(AmountUnit::MilligramPerLitre),
            "g/L" => Ok(AmountUnit::GramPerLitre),
            "mol/L" => Ok(AmountUnit::MolePerLitre),
            other => Err(UnitParseError {
                kind: "composition",
                unit: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AmountUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            AmountUnit::KilogramPerSecond => "kg/s",
            AmountUnit::GramPerSecond => "g/s",
            AmountUnit::MolePerSecond => "mol/s",
            AmountUnit::MilligramPerLitre => "mg/L",
            AmountUnit::GramPerLitre => "g/L",
            AmountUnit::MolePerLitre => "mol/L",
        };
        f.write_str(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn celsius_maps_to_kelvin_with_offset() {
        let map = TemperatureUnit::Celsius.to_kelvin();
        assert_relative_eq!(map.apply(20.0), 293.15);
        assert_eq!(map.scale, 1.0);
    }

    #[test]
    fn pressure_units_scale_to_pascal() {
        assert_relative_eq!(PressureUnit::Bar.to_pascal().apply(1.0), 1.0e5);
        assert_relative_eq!(PressureUnit::Atmosphere.to_pascal().apply(2.0), 202_650.0);
        assert_relative_eq!(PressureUnit::KiloPascal.to_pascal().apply(101.325), 101_325.0);
    }

    #[test]
    fn milligram_per_litre_converts_to_moles() {
        let factor = AmountUnit::MilligramPerLitre.moles_per_unit(40.078);
        assert_relative_eq!(400.0 * factor, 400.0e-3 / 40.078, epsilon = 1e-15);
    }

    #[test]
    fn mass_flow_units_report_mass_flow_basis() {
        assert_eq!(AmountUnit::KilogramPerSecond.basis(), CompositionBasis::MassFlow);
        assert_eq!(AmountUnit::MolePerLitre.basis(), CompositionBasis::Concentration);
    }

    #[test]
    fn kilograms_per_unit_of_mole_flow_uses_molar_mass() {
        assert_relative_eq!(
            AmountUnit::MolePerSecond.kilograms_per_unit(WATER_MOLAR_MASS),
            0.018015
        );
    }

    #[test]
    fn parses_unit_symbols_and_rejects_unknown_ones() {
        assert_eq!("mg/L".parse::<AmountUnit>(), Ok(AmountUnit::MilligramPerLitre));
        assert_eq!("degC".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Celsius));
        assert_eq!("bar".parse::<PressureUnit>(), Ok(PressureUnit::Bar));
        let err = "furlong/s".parse::<AmountUnit>().unwrap_err();
        assert_eq!(err.unit, "furlong/s");
    }
}
