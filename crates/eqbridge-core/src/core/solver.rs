//! Damped Newton solver for square host models.

use super::model::{HostModel, ModelError, VarId};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

pub type ObserverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A participant that may rewrite relations between Newton iterations.
pub trait SolveObserver {
    /// Called once before the first iteration (`iteration == 0`) and after
    /// every accepted step.
    ///
    /// # Return
    ///
    /// `Ok(true)` if the observer changed any relation.
    fn after_iteration(&mut self, model: &mut HostModel, iteration: usize) -> Result<bool, ObserverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    Optimal,
    MaxIterations,
    Singular,
    DegreesOfFreedom(isize),
    ObserverFailed,
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationStatus::Optimal => write!(f, "optimal"),
            TerminationStatus::MaxIterations => write!(f, "maximum iterations reached"),
            TerminationStatus::Singular => write!(f, "singular Jacobian"),
            TerminationStatus::DegreesOfFreedom(dof) => write!(f, "{dof} degrees of freedom"),
            TerminationStatus::ObserverFailed => write!(f, "observer failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Solver terminated ({status}) after {iterations} iterations, residual norm {residual_norm:.3e}")]
    Termination {
        status: TerminationStatus,
        iterations: usize,
        residual_norm: f64,
    },
    #[error("Host model error: {0}")]
    Model(#[from] ModelError),
    #[error("Observer failed at iteration {iteration}: {source}")]
    Observer {
        iteration: usize,
        #[source]
        source: ObserverError,
    },
}

impl SolverError {
    pub fn status(&self) -> TerminationStatus {
        match self {
            SolverError::Termination { status, .. } => *status,
            SolverError::Model(_) => TerminationStatus::Singular,
            SolverError::Observer { .. } => TerminationStatus::ObserverFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Fraction of the distance to a bound a single step may cover.
    pub bound_push: f64,
    pub max_backtracks: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 1.0e-8,
            max_iterations: 100,
            bound_push: 0.99,
            max_backtracks: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub status: TerminationStatus,
    pub iterations: usize,
    pub residual_norm: f64,
    /// Iterations after which at least one observer changed the relations.
    pub observer_updates: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HostSolver {
    options: SolverOptions,
}

impl HostSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Solves `model` in place.
    ///
    /// Observers run before the first iteration and after every step; a
    /// converged point is only accepted once no observer wants to change it.
    pub fn solve(
        &self,
        model: &mut HostModel,
        observers: &mut [&mut dyn SolveObserver],
    ) -> Result<SolveReport, SolverError> {
        let dof = model.degrees_of_freedom();
        if dof != 0 {
            return Err(SolverError::Termination {
                status: TerminationStatus::DegreesOfFreedom(dof),
                iterations: 0,
                residual_norm: f64::NAN,
            });
        }

        let mut observer_updates = 0;
        if notify(observers, model, 0)? {
            observer_updates += 1;
        }

        let mut iterations = 0;
        loop {
            let free = model.free_variables();
            let residual = residual_vector(model)?;
            let norm = residual.amax();
            trace!(iteration = iterations, residual = norm, "Newton iteration");

            if !norm.is_finite() {
                warn!("Non-finite residual encountered at iteration {iterations}");
                return Err(SolverError::Termination {
                    status: TerminationStatus::Singular,
                    iterations,
                    residual_norm: norm,
                });
            }
            if norm <= self.options.tolerance {
                debug!(iterations, residual = norm, "Host model converged");
                return Ok(SolveReport {
                    status: TerminationStatus::Optimal,
                    iterations,
                    residual_norm: norm,
                    observer_updates,
                });
            }
            if iterations >= self.options.max_iterations {
                return Err(SolverError::Termination {
                    status: TerminationStatus::MaxIterations,
                    iterations,
                    residual_norm: norm,
                });
            }

            let jacobian = jacobian_matrix(model, &free)?;
            let step = jacobian
                .lu()
                .solve(&(-&residual))
                .ok_or(SolverError::Termination {
                    status: TerminationStatus::Singular,
                    iterations,
                    residual_norm: norm,
                })?;

            let alpha = self.max_step_within_bounds(model, &free, &step)?;
            self.line_search(model, &free, &step, alpha, norm)?;
            iterations += 1;

            if notify(observers, model, iterations)? {
                observer_updates += 1;
            }
        }
    }

    fn max_step_within_bounds(
        &self,
        model: &HostModel,
        free: &[VarId],
        step: &DVector<f64>,
    ) -> Result<f64, ModelError> {
        let mut alpha: f64 = 1.0;
        for (col, id) in free.iter().enumerate() {
            let var = model.variable(*id).ok_or(ModelError::UnknownVariable(*id))?;
            let dx = step[col];
            if dx < 0.0 {
                if let Some(lo) = var.lower {
                    let room = var.value - lo;
                    if var.value + dx < lo {
                        alpha = alpha.min(self.options.bound_push * room.max(0.0) / -dx);
                    }
                }
            } else if dx > 0.0 {
                if let Some(hi) = var.upper {
                    let room = hi - var.value;
                    if var.value + dx > hi {
                        alpha = alpha.min(self.options.bound_push * room.max(0.0) / dx);
                    }
                }
            }
        }
        Ok(alpha)
    }

    /// Backtracks from `alpha` until the residual norm decreases; the last
    /// trial step is kept if none does.
    fn line_search(
        &self,
        model: &mut HostModel,
        free: &[VarId],
        step: &DVector<f64>,
        alpha: f64,
        norm: f64,
    ) -> Result<(), ModelError> {
        let start: Vec<f64> = free
            .iter()
            .map(|id| model.value(*id))
            .collect::<Result<_, _>>()?;
        let mut alpha = alpha;
        for attempt in 0..=self.options.max_backtracks {
            for (col, id) in free.iter().enumerate() {
                model.set_value(*id, start[col] + alpha * step[col])?;
            }
            let trial = residual_vector(model)?.amax();
            if trial.is_finite() && trial < (1.0 - 1.0e-4 * alpha) * norm {
                return Ok(());
            }
            if attempt < self.options.max_backtracks {
                alpha *= 0.5;
            }
        }
        trace!(alpha, "Line search exhausted; keeping shortest step");
        Ok(())
    }
}

fn notify(
    observers: &mut [&mut dyn SolveObserver],
    model: &mut HostModel,
    iteration: usize,
) -> Result<bool, SolverError> {
    let mut changed = false;
    for observer in observers.iter_mut() {
        changed |= observer
            .after_iteration(model, iteration)
            .map_err(|source| SolverError::Observer { iteration, source })?;
    }
    Ok(changed)
}

fn residual_vector(model: &HostModel) -> Result<DVector<f64>, ModelError> {
    let values = model
        .relation_ids()
        .into_iter()
        .map(|id| model.residual(id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DVector::from_vec(values))
}

fn jacobian_matrix(model: &HostModel, free: &[VarId]) -> Result<DMatrix<f64>, ModelError> {
    let columns: HashMap<VarId, usize> = free.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let relations = model.relation_ids();
    let mut jacobian = DMatrix::zeros(relations.len(), free.len());
    for (row, id) in relations.iter().enumerate() {
        for (var, derivative) in model.gradient(*id)? {
            if let Some(col) = columns.get(&var) {
                jacobian[(row, *col)] += derivative;
            }
        }
    }
    Ok(jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Relation, Variable};
    use approx::assert_relative_eq;

    #[test]
    fn solves_square_nonlinear_system() {
        let mut model = HostModel::new();
        let x = model.add_variable(Variable::new("x", 1.0));
        let y = model.add_variable(Variable::new("y", 1.0));
        model
            .add_relation(Relation::expression("circle", vec![x, y], |v| v[0] * v[0] + v[1] * v[1] - 4.0))
            .unwrap();
        model.add_relation(Relation::linear("line", vec![(x, 1.0), (y, -1.0)], 0.0)).unwrap();

        let report = HostSolver::default().solve(&mut model, &mut []).unwrap();

        assert_eq!(report.status, TerminationStatus::Optimal);
        assert_relative_eq!(model.value(x).unwrap(), 2.0_f64.sqrt(), epsilon = 1e-7);
        assert_relative_eq!(model.value(y).unwrap(), 2.0_f64.sqrt(), epsilon = 1e-7);
    }

    #[test]
    fn rejects_non_square_model() {
        let mut model = HostModel::new();
        model.add_variable(Variable::new("x", 1.0));
        let err = HostSolver::default().solve(&mut model, &mut []).unwrap_err();
        assert_eq!(err.status(), TerminationStatus::DegreesOfFreedom(1));
    }

    #[test]
    fn reports_singular_jacobian() {
        let mut model = HostModel::new();
        let x = model.add_variable(Variable::new("x", 1.0));
        let y = model.add_variable(Variable::new("y", 1.0));
        model.add_relation(Relation::linear("a", vec![(x, 1.0), (y, 1.0)], -1.0)).unwrap();
        model.add_relation(Relation::linear("b", vec![(x, 2.0), (y, 2.0)], -5.0)).unwrap();
        let err = HostSolver::default().solve(&mut model, &mut []).unwrap_err();
        assert_eq!(err.status(), TerminationStatus::Singular);
    }

    #[test]
    fn keeps_bounded_variables_feasible() {
        let mut model = HostModel::new();
        let x = model.add_variable(Variable::new("x", 1.0).non_negative());
        model
            .add_relation(Relation::expression("ln", vec![x], |v| v[0].ln() + 3.0))
            .unwrap();
        HostSolver::default().solve(&mut model, &mut []).unwrap();
        assert_relative_eq!(model.value(x).unwrap(), (-3.0_f64).exp(), epsilon = 1e-9);
    }

    struct CountingObserver {
        calls: Vec<usize>,
    }

    impl SolveObserver for CountingObserver {
        fn after_iteration(&mut self, _model: &mut HostModel, iteration: usize) -> Result<bool, ObserverError> {
            self.calls.push(iteration);
            Ok(false)
        }
    }

    #[test]
    fn observers_run_before_and_after_each_step() {
        let mut model = HostModel::new();
        let x = model.add_variable(Variable::new("x", 0.0));
        model.add_relation(Relation::linear("a", vec![(x, 1.0)], -3.0)).unwrap();
        let mut observer = CountingObserver { calls: Vec::new() };
        let report = HostSolver::default()
            .solve(&mut model, &mut [&mut observer])
            .unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(observer.calls, vec![0, 1]);
    }

    struct FailingObserver;

    impl SolveObserver for FailingObserver {
        fn after_iteration(&mut self, _model: &mut HostModel, _iteration: usize) -> Result<bool, ObserverError> {
            Err("oracle unavailable".into())
        }
    }

    #[test]
    fn observer_failure_aborts_solve() {
        let mut model = HostModel::new();
        let x = model.add_variable(Variable::new("x", 0.0));
        model.add_relation(Relation::linear("a", vec![(x, 1.0)], -3.0)).unwrap();
        let err = HostSolver::default()
            .solve(&mut model, &mut [&mut FailingObserver])
            .unwrap_err();
        assert_eq!(err.status(), TerminationStatus::ObserverFailed);
    }
}
