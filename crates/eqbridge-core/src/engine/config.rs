use crate::core::chemistry::{ActivityModel, OutputKey};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: String,
    },
}

/// Decides when a bridge's linearization point is considered stale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelinearizationPolicy {
    /// Stale once any mapped host input moved by more than `threshold`
    /// relative to its reference value; `floor` bounds the denominator for
    /// inputs whose reference is near zero.
    InputDelta { threshold: f64, floor: f64 },
    /// Stale every `n` host solver iterations.
    EveryNIterations(usize),
}

impl Default for RelinearizationPolicy {
    fn default() -> Self {
        RelinearizationPolicy::InputDelta {
            threshold: 1.0e-3,
            floor: 1.0e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DerivativeMode {
    /// Engine-provided derivatives, central differences when the engine has none.
    #[default]
    Analytic,
    FiniteDifference { relative_step: f64 },
}

pub const DEFAULT_FD_STEP: f64 = 1.0e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub activity_model: ActivityModel,
    /// Characteristic magnitude per output; the relation is scaled by its inverse.
    pub user_scaling: HashMap<OutputKey, f64>,
    pub relinearization: RelinearizationPolicy,
    pub derivatives: DerivativeMode,
    pub retry_with_fallback: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            activity_model: ActivityModel::default(),
            user_scaling: HashMap::new(),
            relinearization: RelinearizationPolicy::default(),
            derivatives: DerivativeMode::default(),
            retry_with_fallback: true,
        }
    }
}

#[derive(Default)]
pub struct BridgeConfigBuilder {
    activity_model: Option<ActivityModel>,
    user_scaling: HashMap<OutputKey, f64>,
    relinearization: Option<RelinearizationPolicy>,
    derivatives: Option<DerivativeMode>,
    retry_with_fallback: Option<bool>,
}

impl BridgeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity_model(mut self, model: ActivityModel) -> Self {
        self.activity_model = Some(model);
        self
    }
    pub fn user_scaling(mut self, key: OutputKey, magnitude: f64) -> Self {
        self.user_scaling.insert(key, magnitude);
        self
    }
    pub fn relinearization(mut self, policy: RelinearizationPolicy) -> Self {
        self.relinearization = Some(policy);
        self
    }
    pub fn derivatives(mut self, mode: DerivativeMode) -> Self {
        self.derivatives = Some(mode);
        self
    }
    pub fn retry_with_fallback(mut self, retry: bool) -> Self {
        self.retry_with_fallback = Some(retry);
        self
    }

    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        for (key, magnitude) in &self.user_scaling {
            if !(magnitude.is_finite() && *magnitude > 0.0) {
                return Err(ConfigError::InvalidValue {
                    parameter: "user_scaling",
                    reason: format!("scaling for '{key}' must be positive and finite, got {magnitude}"),
                });
            }
        }

        let relinearization = self.relinearization.unwrap_or_default();
        match relinearization {
            RelinearizationPolicy::InputDelta { threshold, floor } if !(threshold > 0.0 && floor > 0.0) => {
                return Err(ConfigError::InvalidValue {
                    parameter: "relinearization",
                    reason: format!("threshold ({threshold}) and floor ({floor}) must be positive"),
                });
            }
            RelinearizationPolicy::EveryNIterations(0) => {
                return Err(ConfigError::InvalidValue {
                    parameter: "relinearization",
                    reason: "iteration interval must be at least 1".to_string(),
                });
            }
            _ => {}
        }

        let derivatives = self.derivatives.unwrap_or_default();
        if let DerivativeMode::FiniteDifference { relative_step } = derivatives {
            if !(relative_step > 0.0 && relative_step < 1.0) {
                return Err(ConfigError::InvalidValue {
                    parameter: "derivatives",
                    reason: format!("relative step must lie in (0, 1), got {relative_step}"),
                });
            }
        }

        Ok(BridgeConfig {
            activity_model: self.activity_model.unwrap_or_default(),
            user_scaling: self.user_scaling,
            relinearization,
            derivatives,
            retry_with_fallback: self.retry_with_fallback.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default_config() {
        assert_eq!(BridgeConfigBuilder::new().build().unwrap(), BridgeConfig::default());
    }

    #[test]
    fn builder_records_user_scaling() {
        let config = BridgeConfigBuilder::new()
            .activity_model(ActivityModel::DebyeHuckel)
            .user_scaling(OutputKey::scalar("density"), 1000.0)
            .build()
            .unwrap();
        assert_eq!(config.activity_model, ActivityModel::DebyeHuckel);
        assert_eq!(config.user_scaling.get(&OutputKey::scalar("density")), Some(&1000.0));
    }

    #[test]
    fn builder_rejects_non_positive_scaling() {
        let result = BridgeConfigBuilder::new()
            .user_scaling(OutputKey::scalar("density"), 0.0)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                parameter: "user_scaling",
                ..
            })
        ));
    }

    #[test]
    fn builder_rejects_degenerate_relinearization_policies() {
        for policy in [
            RelinearizationPolicy::EveryNIterations(0),
            RelinearizationPolicy::InputDelta {
                threshold: 0.0,
                floor: 1.0,
            },
        ] {
            assert!(BridgeConfigBuilder::new().relinearization(policy).build().is_err());
        }
    }

    #[test]
    fn builder_rejects_out_of_range_fd_step() {
        let result = BridgeConfigBuilder::new()
            .derivatives(DerivativeMode::FiniteDifference { relative_step: 2.0 })
            .build();
        assert!(result.is_err());
    }
}
