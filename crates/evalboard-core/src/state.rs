//! Run status state machine
//!
//! ```text
//! pending ──► running ──► completed
//!    │           │            │
//!    └──► failed ◄┘            │
//!           │                  │
//!           └──► running ◄─────┘   (re-run)
//! ```
//!
//! Stores call [`validate_transition`] under the same lock or transaction as
//! the status write, which makes every status change a compare-and-set.

use crate::error::StoreError;
use crate::types::RunStatus;

/// Validates a status change.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), StoreError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

/// Statuses reachable from `from` in one step.
#[must_use]
pub fn allowed_transitions(from: RunStatus) -> &'static [RunStatus] {
    match from {
        RunStatus::Pending => &[RunStatus::Running, RunStatus::Failed],
        RunStatus::Running => &[RunStatus::Completed, RunStatus::Failed],
        RunStatus::Completed | RunStatus::Failed => &[RunStatus::Running],
    }
}

fn allowed(from: RunStatus, to: RunStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn start_from_any_idle_status() {
        assert!(validate_transition(RunStatus::Pending, RunStatus::Running).is_ok());
        assert!(validate_transition(RunStatus::Failed, RunStatus::Running).is_ok());
        assert!(validate_transition(RunStatus::Completed, RunStatus::Running).is_ok());

        // Double start is rejected
        assert!(validate_transition(RunStatus::Running, RunStatus::Running).is_err());
    }

    #[test]
    fn completion_only_from_running() {
        assert!(validate_transition(RunStatus::Running, RunStatus::Completed).is_ok());
        assert!(validate_transition(RunStatus::Pending, RunStatus::Completed).is_err());
        assert!(validate_transition(RunStatus::Failed, RunStatus::Completed).is_err());
    }

    #[test]
    fn failure_edges() {
        assert!(validate_transition(RunStatus::Pending, RunStatus::Failed).is_ok());
        assert!(validate_transition(RunStatus::Running, RunStatus::Failed).is_ok());
        assert!(validate_transition(RunStatus::Completed, RunStatus::Failed).is_err());
    }

    fn any_status() -> impl Strategy<Value = RunStatus> {
        prop_oneof![
            Just(RunStatus::Pending),
            Just(RunStatus::Running),
            Just(RunStatus::Completed),
            Just(RunStatus::Failed),
        ]
    }

    proptest! {
        #[test]
        fn prop_validation_agrees_with_table(from in any_status(), to in any_status()) {
            let res = validate_transition(from, to);
            let allowed = allowed_transitions(from);

            if res.is_ok() {
                prop_assert!(allowed.contains(&to));
            } else {
                prop_assert!(!allowed.contains(&to));
            }
        }

        #[test]
        fn prop_no_self_loops(status in any_status()) {
            prop_assert!(validate_transition(status, status).is_err());
        }
    }
}
