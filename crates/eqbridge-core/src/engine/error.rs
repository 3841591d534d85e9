use thiserror::Error;

use super::config::ConfigError;
use super::mapper::MapperError;
use super::oracle::OracleError;
use crate::core::chemistry::OutputKey;
use crate::core::model::ModelError;
use crate::core::solver::{SolverError, TerminationStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("State mapping failed: {0}")]
    Mapper(#[from] MapperError),

    #[error("Equilibrium oracle failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("Host model error: {0}")]
    Model(#[from] ModelError),

    #[error("Bridge '{bridge}' failed to initialize: {source}")]
    Initialization {
        bridge: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Bridge '{bridge}' failed to re-evaluate at host iteration {iteration}: {source}")]
    ReEvaluation {
        bridge: String,
        iteration: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Host solver terminated ({status}) after {iterations} iterations, residual norm {residual_norm:.3e}")]
    HostSolverTermination {
        status: TerminationStatus,
        iterations: usize,
        residual_norm: f64,
    },

    #[error("Output '{0}' is requested more than once")]
    DuplicateOutput(OutputKey),

    #[error("Bridge '{bridge}' has not been initialized")]
    NotInitialized { bridge: String },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl From<SolverError> for EngineError {
    fn from(err: SolverError) -> Self {
        match err {
            SolverError::Termination {
                status,
                iterations,
                residual_norm,
            } => EngineError::HostSolverTermination {
                status,
                iterations,
                residual_norm,
            },
            SolverError::Model(e) => EngineError::Model(e),
            SolverError::Observer { iteration, source } => match source.downcast::<EngineError>() {
                Ok(engine) => *engine,
                Err(other) => EngineError::Internal(format!("observer failed at iteration {iteration}: {other}")),
            },
        }
    }
}

impl EngineError {
    /// Whether the failure came from the equilibrium calculation itself
    /// rather than from configuration or the host solve.
    pub fn is_oracle_failure(&self) -> bool {
        match self {
            EngineError::Oracle(_) => true,
            EngineError::Initialization { source, .. } | EngineError::ReEvaluation { source, .. } => {
                source.is_oracle_failure()
            }
            _ => false,
        }
    }
}
