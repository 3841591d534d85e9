//! First-order Taylor surrogates of oracle outputs in host variables.

use crate::core::chemistry::OutputKey;
use crate::core::model::{HostModel, ModelError, Relation, VarId};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Scaled magnitudes outside this band are reported as poorly conditioned.
const WELL_CONDITIONED: (f64, f64) = (1.0e-3, 1.0e3);
const SCALED_DERIVATIVE_LIMIT: f64 = 1.0e8;
const ZERO_REFERENCE: f64 = 1.0e-12;

/// Value of one host variable at the linearization point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceInput {
    pub variable: VarId,
    pub value: f64,
    pub fixed: bool,
}

/// Reference value and host-variable partials of one output.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianEntry {
    pub key: OutputKey,
    pub value_ref: f64,
    pub partials: Vec<(VarId, f64)>,
}

impl JacobianEntry {
    pub fn partial(&self, variable: VarId) -> f64 {
        self.partials
            .iter()
            .filter(|(v, _)| *v == variable)
            .map(|(_, d)| *d)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditioningIssue {
    ScaledValue,
    ScaledDerivative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningWarning {
    pub key: OutputKey,
    pub issue: ConditioningIssue,
    pub magnitude: f64,
}

impl fmt::Display for ConditioningWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.issue {
            ConditioningIssue::ScaledValue => "scaled value",
            ConditioningIssue::ScaledDerivative => "largest scaled derivative",
        };
        write!(f, "'{}': {} has magnitude {:.3e}", self.key, what, self.magnitude)
    }
}

/// `output = constant + Σ J_i · x_i`, multiplied through by `scaling`.
#[derive(Debug, Clone, PartialEq)]
pub struct SurrogateRelation {
    pub key: OutputKey,
    pub output: VarId,
    pub terms: Vec<(VarId, f64)>,
    pub constant: f64,
    pub scaling: f64,
    /// Every input of this row is fixed, so it pins the output to its
    /// reference value.
    pub degenerate: bool,
}

impl SurrogateRelation {
    pub fn to_relation(&self, name: impl Into<String>) -> Relation {
        let mut terms = vec![(self.output, 1.0)];
        for (var, coeff) in &self.terms {
            match terms.iter_mut().find(|(v, _)| v == var) {
                Some((_, c)) => *c -= coeff,
                None => terms.push((*var, -coeff)),
            }
        }
        Relation::linear(name, terms, -self.constant).with_scaling(self.scaling)
    }

    /// Output value the surrogate predicts at the model's current inputs.
    pub fn predict(&self, model: &HostModel) -> Result<f64, ModelError> {
        let mut value = self.constant;
        for (var, coeff) in &self.terms {
            value += coeff * model.value(*var)?;
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurrogateSet {
    pub relations: Vec<SurrogateRelation>,
    pub warnings: Vec<ConditioningWarning>,
}

/// Builds one surrogate relation per entry, bound to `outputs` in the same
/// order. Inputs missing from `reference` are taken at zero.
pub fn build(
    entries: &[JacobianEntry],
    outputs: &[VarId],
    reference: &[ReferenceInput],
    overrides: &HashMap<OutputKey, f64>,
) -> SurrogateSet {
    let mut set = SurrogateSet::default();
    for (entry, output) in entries.iter().zip(outputs) {
        let mut constant = entry.value_ref;
        let mut terms = Vec::with_capacity(entry.partials.len());
        let mut degenerate = true;
        for (var, derivative) in &entry.partials {
            if *derivative == 0.0 {
                continue;
            }
            let point = reference.iter().find(|r| r.variable == *var);
            constant -= derivative * point.map_or(0.0, |r| r.value);
            degenerate &= point.is_some_and(|r| r.fixed);
            terms.push((*var, *derivative));
        }

        let scaling = match overrides.get(&entry.key) {
            Some(magnitude) => 1.0 / magnitude,
            None if entry.value_ref.abs() > ZERO_REFERENCE => 1.0 / entry.value_ref.abs(),
            None => 1.0,
        };

        let scaled_value = (scaling * entry.value_ref).abs();
        if scaled_value > 0.0 && !(WELL_CONDITIONED.0..=WELL_CONDITIONED.1).contains(&scaled_value) {
            set.warnings.push(ConditioningWarning {
                key: entry.key.clone(),
                issue: ConditioningIssue::ScaledValue,
                magnitude: scaled_value,
            });
        }
        let scaled_derivative = terms.iter().fold(0.0_f64, |m, (_, d)| m.max((scaling * d).abs()));
        if scaled_derivative > SCALED_DERIVATIVE_LIMIT {
            set.warnings.push(ConditioningWarning {
                key: entry.key.clone(),
                issue: ConditioningIssue::ScaledDerivative,
                magnitude: scaled_derivative,
            });
        }

        set.relations.push(SurrogateRelation {
            key: entry.key.clone(),
            output: *output,
            terms,
            constant,
            scaling,
            degenerate,
        });
    }

    for warning in &set.warnings {
        warn!("Poorly conditioned surrogate relation {warning}");
    }
    set
}
