//! # Chemistry Module
//!
//! The equilibrium oracle boundary and the built-in aqueous engine.
//!
//! An [`EquilibriumEngine`] receives a flat vector of mapped inputs (temperature,
//! pressure, pH, solvent mass and per-species or per-element amounts, all in
//! K, Pa, kg and mol) together with the mineral phases allowed to form, and
//! returns the requested properties. Engines that can differentiate their
//! results report a Jacobian with one row per requested [`OutputKey`] and one
//! column per input; engines that cannot leave that to the caller.
//!
//! - [`activity`] - activity coefficient models
//! - [`water`] - water and seawater property correlations
//! - [`aqueous`] - [`AqueousEngine`], speciation with mineral precipitation

pub mod activity;
pub mod aqueous;
pub mod water;

pub use activity::ActivityModel;
pub use aqueous::AqueousEngine;

use nalgebra::DMatrix;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One dimension of the oracle input vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputId {
    Temperature,
    Pressure,
    Ph,
    /// Solvent water in kg.
    Solvent,
    /// Amount of a canonical species in mol.
    Species(String),
    /// Total amount of an element in mol.
    Element(String),
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputId::Temperature => write!(f, "temperature"),
            InputId::Pressure => write!(f, "pressure"),
            InputId::Ph => write!(f, "pH"),
            InputId::Solvent => write!(f, "solvent"),
            InputId::Species(name) => write!(f, "species[{name}]"),
            InputId::Element(name) => write!(f, "element[{name}]"),
        }
    }
}

/// A requested property: a name and an optional sub-index such as a mineral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey {
    pub property: String,
    pub index: Option<String>,
}

impl OutputKey {
    pub fn scalar(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            index: None,
        }
    }

    pub fn indexed(property: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            index: Some(index.into()),
        }
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{}[{}]", self.property, index),
            None => write!(f, "{}", self.property),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("Malformed output key '{0}', expected 'property' or 'property[index]'")]
pub struct OutputKeyParseError(pub String);

impl FromStr for OutputKey {
    type Err = OutputKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('[') {
            None if !s.is_empty() && !s.contains(']') => Ok(OutputKey::scalar(s)),
            Some((property, rest)) => {
                let index = rest
                    .strip_suffix(']')
                    .filter(|i| !i.is_empty() && !i.contains(['[', ']']))
                    .ok_or_else(|| OutputKeyParseError(s.to_string()))?;
                if property.is_empty() {
                    return Err(OutputKeyParseError(s.to_string()));
                }
                Ok(OutputKey::indexed(property, index))
            }
            None => Err(OutputKeyParseError(s.to_string())),
        }
    }
}

/// Starting strategy for the engine's internal iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialGuess {
    #[default]
    Default,
    /// A damped iteration from an ideal-solution start, slower but more robust.
    Fallback,
}

/// A complete equilibrium request.
#[derive(Debug, Clone, PartialEq)]
pub struct EquilibriumProblem {
    pub inputs: Vec<(InputId, f64)>,
    pub phases: Vec<String>,
    pub activity_model: ActivityModel,
    pub initial_guess: InitialGuess,
}

impl EquilibriumProblem {
    pub fn values(&self) -> Vec<f64> {
        self.inputs.iter().map(|(_, v)| *v).collect()
    }

    /// A copy of this problem with input `position` replaced by `value`.
    pub fn with_input(&self, position: usize, value: f64) -> Self {
        let mut problem = self.clone();
        if let Some(entry) = problem.inputs.get_mut(position) {
            entry.1 = value;
        }
        problem
    }
}

/// Values of the requested outputs and, optionally, their Jacobian with
/// respect to the problem inputs (`outputs × inputs`).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub values: Vec<f64>,
    pub jacobian: Option<DMatrix<f64>>,
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ChemistryError {
    #[error("Unknown output '{key}'")]
    UnknownOutput { key: String },
    #[error("Output '{key}' needs phase '{phase}' to be allowed to form")]
    PhaseNotPresent { key: String, phase: String },
    #[error("Unknown species '{0}'")]
    UnknownSpecies(String),
    #[error("Unknown element '{0}'")]
    UnknownElement(String),
    #[error("Unknown mineral phase '{0}'")]
    UnknownPhase(String),
    #[error("Unknown activity model '{0}'")]
    UnknownActivityModel(String),
    #[error("Missing required input: {0}")]
    MissingInput(&'static str),
    #[error("Equilibrium calculation diverged: {reason}")]
    Diverged { reason: String },
}

/// The oracle boundary.
pub trait EquilibriumEngine {
    fn name(&self) -> &str;

    /// Checks up front that `key` can be evaluated with the given phases.
    fn check_output(&self, key: &OutputKey, phases: &[String]) -> Result<(), ChemistryError>;

    /// Solves the problem and evaluates `outputs`. When `with_derivatives` is
    /// set and the engine can differentiate, the response carries the
    /// Jacobian computed from the same solve.
    fn solve(
        &self,
        problem: &EquilibriumProblem,
        outputs: &[OutputKey],
        with_derivatives: bool,
    ) -> Result<EngineResponse, ChemistryError>;

    /// Releases engine-side resources. The built-in engine holds none.
    fn release(&mut self) {}
}
