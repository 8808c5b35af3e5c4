//! Task lifecycle rules.
//!
//! Transitions are monotonic: `Setup -> Running -> Finished`, and `Failure`
//! from any non-terminal state. Nothing leaves a terminal state.

use kvas_types::TaskState;
use thiserror::Error;

/// An attempted transition that the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    /// State the task was in.
    pub from: TaskState,
    /// State that was requested.
    pub to: TaskState,
}

/// Validate a transition and return the new state.
pub fn transition(from: TaskState, to: TaskState) -> Result<TaskState, TransitionError> {
    use TaskState::*;

    match (from, to) {
        (Setup, Running) | (Running, Finished) | (Setup, Failure) | (Running, Failure) => Ok(to),
        _ => Err(TransitionError { from, to }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    const ALL: [TaskState; 4] = [Setup, Running, Finished, Failure];

    #[test]
    fn happy_path_is_allowed() {
        assert_eq!(transition(Setup, Running), Ok(Running));
        assert_eq!(transition(Running, Finished), Ok(Finished));
    }

    #[test]
    fn failure_reachable_from_non_terminal_states() {
        assert_eq!(transition(Setup, Failure), Ok(Failure));
        assert_eq!(transition(Running, Failure), Ok(Failure));
    }

    #[test]
    fn setup_cannot_skip_running() {
        assert!(transition(Setup, Finished).is_err());
    }

    #[test]
    fn nothing_moves_backwards() {
        assert!(transition(Running, Setup).is_err());
        assert!(transition(Finished, Running).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        for to in ALL {
            assert!(transition(Finished, to).is_err());
            assert!(transition(Failure, to).is_err());
        }
    }

    #[test]
    fn self_transitions_are_rejected() {
        for state in ALL {
            assert_eq!(
                transition(state, state),
                Err(TransitionError { from: state, to: state })
            );
        }
    }
}
