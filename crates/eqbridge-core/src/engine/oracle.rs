use super::config::{BridgeConfig, DerivativeMode};
use super::mapper::OracleInput;
use crate::core::chemistry::{
    ActivityModel, ChemistryError, EngineResponse, EquilibriumEngine, EquilibriumProblem, InitialGuess, InputId,
    OutputKey,
};
use nalgebra::DMatrix;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, PartialEq, Clone)]
pub enum OracleError {
    #[error("Unknown output '{key}' for equilibrium engine '{engine}'")]
    UnknownOutput { key: String, engine: String },
    #[error("Equilibrium calculation diverged after {attempts} attempt(s): {reason}")]
    EquilibriumDiverged { reason: String, attempts: usize },
    #[error("Equilibrium engine rejected the problem: {0}")]
    Engine(#[from] ChemistryError),
    #[error("Engine returned {got} values where {expected} were expected")]
    MalformedResponse { expected: String, got: String },
}

/// Values and first derivatives of a set of outputs at one input point.
///
/// `jacobian` has one row per key and one column per oracle input, in the
/// order of `inputs`.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleEvaluation {
    pub inputs: Vec<(InputId, f64)>,
    pub keys: Vec<OutputKey>,
    pub values: Vec<f64>,
    pub jacobian: DMatrix<f64>,
    /// Whether the derivatives came from the engine rather than from
    /// finite differences.
    pub analytic: bool,
}

impl OracleEvaluation {
    pub fn value(&self, key: &OutputKey) -> Option<f64> {
        self.keys.iter().position(|k| k == key).map(|row| self.values[row])
    }
}

/// Wraps an [`EquilibriumEngine`] behind a single `evaluate` call.
///
/// Each evaluation is one logical oracle call; the counters record how many
/// raw engine solves it cost, including perturbations and retries.
#[derive(Debug)]
pub struct OracleAdapter<E> {
    engine: E,
    activity_model: ActivityModel,
    derivatives: DerivativeMode,
    retry_with_fallback: bool,
    engine_solves: usize,
    fallback_retries: usize,
}

impl<E: EquilibriumEngine> OracleAdapter<E> {
    pub fn new(engine: E, config: &BridgeConfig) -> Self {
        Self {
            engine,
            activity_model: config.activity_model,
            derivatives: config.derivatives,
            retry_with_fallback: config.retry_with_fallback,
            engine_solves: 0,
            fallback_retries: 0,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_solves(&self) -> usize {
        self.engine_solves
    }

    pub fn fallback_retries(&self) -> usize {
        self.fallback_retries
    }

    /// Rejects keys the engine cannot evaluate with the given phases.
    pub fn check_outputs(&self, keys: &[OutputKey], phases: &[String]) -> Result<(), OracleError> {
        for key in keys {
            self.engine
                .check_output(key, phases)
                .map_err(|e| self.classify(e, 1))?;
        }
        Ok(())
    }

    pub fn evaluate(&mut self, input: &OracleInput, keys: &[OutputKey]) -> Result<OracleEvaluation, OracleError> {
        let mut problem = EquilibriumProblem {
            inputs: input.inputs.clone(),
            phases: input.phases.clone(),
            activity_model: self.activity_model,
            initial_guess: InitialGuess::Default,
        };
        let analytic = matches!(self.derivatives, DerivativeMode::Analytic);

        let response = self.solve_with_retry(&mut problem, keys, analytic)?;
        if response.values.len() != keys.len() {
            return Err(OracleError::MalformedResponse {
                expected: format!("{} output", keys.len()),
                got: format!("{} output", response.values.len()),
            });
        }

        let n_inputs = problem.inputs.len();
        let (jacobian, analytic) = match response.jacobian {
            Some(jacobian) if analytic => {
                if jacobian.shape() != (keys.len(), n_inputs) {
                    return Err(OracleError::MalformedResponse {
                        expected: format!("{}x{} Jacobian", keys.len(), n_inputs),
                        got: format!("{}x{} Jacobian", jacobian.nrows(), jacobian.ncols()),
                    });
                }
                (jacobian, true)
            }
            _ => (self.finite_differences(&problem, keys, &response.values)?, false),
        };

        debug!(
            engine = self.engine.name(),
            outputs = keys.len(),
            inputs = n_inputs,
            analytic,
            "Oracle evaluated"
        );
        Ok(OracleEvaluation {
            inputs: problem.inputs,
            keys: keys.to_vec(),
            values: response.values,
            jacobian,
            analytic,
        })
    }

    pub fn release(&mut self) {
        self.engine.release();
    }

    /// Solves with the default initial guess and, on divergence, once more
    /// with the fallback guess. `problem` keeps the guess that succeeded.
    fn solve_with_retry(
        &mut self,
        problem: &mut EquilibriumProblem,
        keys: &[OutputKey],
        with_derivatives: bool,
    ) -> Result<EngineResponse, OracleError> {
        self.engine_solves += 1;
        match self.engine.solve(problem, keys, with_derivatives) {
            Ok(response) => Ok(response),
            Err(ChemistryError::Diverged { reason }) if self.retry_with_fallback => {
                warn!(engine = self.engine.name(), %reason, "Equilibrium diverged; retrying with fallback initial guess");
                self.fallback_retries += 1;
                self.engine_solves += 1;
                problem.initial_guess = InitialGuess::Fallback;
                self.engine
                    .solve(problem, keys, with_derivatives)
                    .map_err(|e| self.classify(e, 2))
            }
            Err(e) => Err(self.classify(e, 1)),
        }
    }

    fn finite_differences(
        &mut self,
        problem: &EquilibriumProblem,
        keys: &[OutputKey],
        reference: &[f64],
    ) -> Result<DMatrix<f64>, OracleError> {
        let relative_step = match self.derivatives {
            DerivativeMode::FiniteDifference { relative_step } => relative_step,
            DerivativeMode::Analytic => super::config::DEFAULT_FD_STEP,
        };
        let mut jacobian = DMatrix::zeros(keys.len(), problem.inputs.len());

        for (col, (id, x)) in problem.inputs.iter().enumerate() {
            let h = if *x != 0.0 { relative_step * x.abs() } else { relative_step };
            let one_sided = is_amount(id) && *x - h < 0.0;
            let forward = self.perturbed(problem, keys, col, x + h)?;
            if one_sided {
                for row in 0..keys.len() {
                    jacobian[(row, col)] = (forward[row] - reference[row]) / h;
                }
            } else {
                let backward = self.perturbed(problem, keys, col, x - h)?;
                for row in 0..keys.len() {
                    jacobian[(row, col)] = (forward[row] - backward[row]) / (2.0 * h);
                }
            }
            trace!(input = %id, step = h, one_sided, "Finite-difference column");
        }
        Ok(jacobian)
    }

    fn perturbed(
        &mut self,
        problem: &EquilibriumProblem,
        keys: &[OutputKey],
        position: usize,
        value: f64,
    ) -> Result<Vec<f64>, OracleError> {
        self.engine_solves += 1;
        let response = self
            .engine
            .solve(&problem.with_input(position, value), keys, false)
            .map_err(|e| self.classify(e, 1))?;
        Ok(response.values)
    }

    fn classify(&self, err: ChemistryError, attempts: usize) -> OracleError {
        match err {
            ChemistryError::UnknownOutput { key } => OracleError::UnknownOutput {
                key,
                engine: self.engine.name().to_string(),
            },
            ChemistryError::Diverged { reason } => OracleError::EquilibriumDiverged { reason, attempts },
            other => OracleError::Engine(other),
        }
    }
}

fn is_amount(id: &InputId) -> bool {
    matches!(id, InputId::Solvent | InputId::Species(_) | InputId::Element(_))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::chemistry::AqueousEngine;
    use crate::engine::config::BridgeConfigBuilder;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    /// Outputs `sumSquares` and `first` of its inputs, without derivatives.
    #[derive(Debug, Default)]
    pub(crate) struct QuadraticEngine {
        pub diverge_on_default: bool,
        pub always_diverge: bool,
        pub solves: Cell<usize>,
        pub released: bool,
    }

    impl EquilibriumEngine for QuadraticEngine {
        fn name(&self) -> &str {
            "quadratic"
        }

        fn check_output(&self, key: &OutputKey, _phases: &[String]) -> Result<(), ChemistryError> {
            match key.property.as_str() {
                "sumSquares" | "first" => Ok(()),
                _ => Err(ChemistryError::UnknownOutput { key: key.to_string() }),
            }
        }

        fn solve(
            &self,
            problem: &EquilibriumProblem,
            outputs: &[OutputKey],
            _with_derivatives: bool,
        ) -> Result<EngineResponse, ChemistryError> {
            self.solves.set(self.solves.get() + 1);
            if self.always_diverge || (self.diverge_on_default && problem.initial_guess == InitialGuess::Default) {
                return Err(ChemistryError::Diverged {
                    reason: "stalled".to_string(),
                });
            }
            let x = problem.values();
            if x.iter().any(|v| *v < 0.0) {
                return Err(ChemistryError::Diverged {
                    reason: "negative input".to_string(),
                });
            }
            let mut values = Vec::new();
            for key in outputs {
                self.check_output(key, &problem.phases)?;
                values.push(match key.property.as_str() {
                    "first" => x[0],
                    _ => x.iter().map(|v| v * v).sum(),
                });
            }
            Ok(EngineResponse { values, jacobian: None })
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    fn point(values: &[f64]) -> OracleInput {
        let ids = [InputId::Temperature, InputId::Pressure, InputId::Solvent, InputId::Species("Na+".into())];
        OracleInput {
            inputs: ids.into_iter().zip(values.iter().copied()).collect(),
            phases: vec![],
        }
    }

    fn keys(names: &[&str]) -> Vec<OutputKey> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn engine_without_derivatives_falls_back_to_finite_differences() {
        let mut adapter = OracleAdapter::new(QuadraticEngine::default(), &BridgeConfig::default());
        let eval = adapter.evaluate(&point(&[3.0, 2.0, 1.0, 0.5]), &keys(&["sumSquares"])).unwrap();
        assert!(!eval.analytic);
        assert_eq!(eval.jacobian.shape(), (1, 4));
        assert_relative_eq!(eval.jacobian[(0, 0)], 6.0, max_relative = 1e-6);
        assert_relative_eq!(eval.jacobian[(0, 3)], 1.0, max_relative = 1e-6);
        // one reference solve plus two per input
        assert_eq!(adapter.engine_solves(), 9);
    }

    #[test]
    fn zero_amounts_use_forward_differences() {
        let mut adapter = OracleAdapter::new(QuadraticEngine::default(), &BridgeConfig::default());
        let eval = adapter.evaluate(&point(&[3.0, 2.0, 1.0, 0.0]), &keys(&["sumSquares"])).unwrap();
        assert_relative_eq!(eval.jacobian[(0, 3)], 0.0, epsilon = 1e-5);
        assert_eq!(adapter.engine_solves(), 8);
    }

    #[test]
    fn unknown_output_is_reported_as_unknown_output() {
        let adapter = OracleAdapter::new(QuadraticEngine::default(), &BridgeConfig::default());
        let err = adapter.check_outputs(&keys(&["viscosity"]), &[]).unwrap_err();
        assert_eq!(
            err,
            OracleError::UnknownOutput {
                key: "viscosity".to_string(),
                engine: "quadratic".to_string()
            }
        );
        assert!(err.to_string().to_lowercase().contains("unknown output"));
    }

    #[test]
    fn divergence_is_retried_once_with_fallback_guess() {
        let engine = QuadraticEngine {
            diverge_on_default: true,
            ..Default::default()
        };
        let mut adapter = OracleAdapter::new(engine, &BridgeConfig::default());
        let eval = adapter.evaluate(&point(&[1.0, 2.0, 3.0, 4.0]), &keys(&["first"])).unwrap();
        assert_eq!(eval.values, vec![1.0]);
        assert_eq!(adapter.fallback_retries(), 1);
    }

    #[test]
    fn persistent_divergence_is_never_approximated() {
        let engine = QuadraticEngine {
            always_diverge: true,
            ..Default::default()
        };
        let mut adapter = OracleAdapter::new(engine, &BridgeConfig::default());
        let err = adapter.evaluate(&point(&[1.0, 2.0, 3.0, 4.0]), &keys(&["first"])).unwrap_err();
        assert!(matches!(err, OracleError::EquilibriumDiverged { attempts: 2, .. }));
        assert_eq!(adapter.engine().solves.get(), 2);

        let config = BridgeConfigBuilder::new().retry_with_fallback(false).build().unwrap();
        let engine = QuadraticEngine {
            always_diverge: true,
            ..Default::default()
        };
        let mut adapter = OracleAdapter::new(engine, &config);
        let err = adapter.evaluate(&point(&[1.0, 2.0, 3.0, 4.0]), &keys(&["first"])).unwrap_err();
        assert!(matches!(err, OracleError::EquilibriumDiverged { attempts: 1, .. }));
    }

    #[test]
    fn release_reaches_the_engine() {
        let mut adapter = OracleAdapter::new(QuadraticEngine::default(), &BridgeConfig::default());
        adapter.release();
        assert!(adapter.engine().released);
    }

    fn brine() -> OracleInput {
        let mut inputs = vec![
            (InputId::Temperature, 298.15),
            (InputId::Pressure, 1.0e5),
            (InputId::Ph, 7.8),
            (InputId::Solvent, 1.0),
        ];
        for (name, mol) in [("Na+", 0.48), ("Ca+2", 0.01), ("Cl-", 0.50), ("HCO3-", 0.002)] {
            inputs.push((InputId::Species(name.to_string()), mol));
        }
        OracleInput { inputs, phases: vec![] }
    }

    #[test]
    fn analytic_and_finite_difference_jacobians_agree() {
        let outputs = keys(&["density", "scalingTendency[Calcite]"]);
        let mut analytic = OracleAdapter::new(AqueousEngine::new(), &BridgeConfig::default());
        let exact = analytic.evaluate(&brine(), &outputs).unwrap();
        assert!(exact.analytic);
        assert_eq!(analytic.engine_solves(), 1);

        let config = BridgeConfigBuilder::new()
            .derivatives(DerivativeMode::FiniteDifference { relative_step: 1.0e-6 })
            .build()
            .unwrap();
        let mut numeric = OracleAdapter::new(AqueousEngine::new(), &config);
        let approx = numeric.evaluate(&brine(), &outputs).unwrap();
        assert!(!approx.analytic);
        assert_eq!(exact.values, approx.values);

        for row in 0..outputs.len() {
            for col in [0, 3, 4, 5, 7] {
                assert_relative_eq!(
                    exact.jacobian[(row, col)],
                    approx.jacobian[(row, col)],
                    epsilon = 1e-6,
                    max_relative = 1e-4
                );
            }
        }
        assert_eq!(exact.value(&outputs[0]), Some(exact.values[0]));
    }
}
