//! Sweep lifecycle state.

use serde::{Deserialize, Serialize};

/// Sweep execution state.
///
/// ```text
/// Idle ──start──> Running ──last point──> Complete
///                   │
///                   ├──abort──> Aborted
///                   │
///                   └──failure──> Error
/// ```
///
/// Every path out of `Running` passes through ramp-back first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    /// Nothing running
    Idle,
    /// Sweep actively executing
    Running,
    /// All points measured
    Complete,
    /// Stopped on request
    Aborted,
    /// Stopped by an instrument or I/O failure
    Error,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Complete => write!(f, "Complete"),
            ExperimentState::Aborted => write!(f, "Aborted"),
            ExperimentState::Error => write!(f, "Error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_json_names_match() {
        for state in [
            ExperimentState::Idle,
            ExperimentState::Running,
            ExperimentState::Complete,
            ExperimentState::Aborted,
            ExperimentState::Error,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }
}
