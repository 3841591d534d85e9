use std::fmt;

/// Lifecycle of a bridge block.
///
/// `Unbuilt → Initialized` on explicit initialization, `Initialized/Converged →
/// Stale` when the host solver has moved the inputs away from the reference
/// point, and `Stale → Converged` after re-evaluating the oracle there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeState {
    #[default]
    Unbuilt,
    Initialized,
    Converged,
    Stale,
}

impl BridgeState {
    pub fn is_linearized(&self) -> bool {
        matches!(self, BridgeState::Initialized | BridgeState::Converged)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BridgeState::Unbuilt => "unbuilt",
            BridgeState::Initialized => "initialized",
            BridgeState::Converged => "converged",
            BridgeState::Stale => "stale",
        };
        f.write_str(label)
    }
}

/// Counters that make oracle traffic auditable independently of the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// Logical oracle evaluations (one per initialize or re-linearization).
    pub oracle_calls: usize,
    /// Raw engine solves, including finite-difference perturbations and retries.
    pub engine_solves: usize,
    pub relinearizations: usize,
    pub fallback_retries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_initialized_and_converged_states_are_linearized() {
        assert!(!BridgeState::Unbuilt.is_linearized());
        assert!(BridgeState::Initialized.is_linearized());
        assert!(BridgeState::Converged.is_linearized());
        assert!(!BridgeState::Stale.is_linearized());
        assert_eq!(BridgeState::default(), BridgeState::Unbuilt);
    }
}
