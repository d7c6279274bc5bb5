//! Manager lifecycle state machine.
//!
//! ```text
//! Created -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! `Stopped` is terminal. A daemon whose startup fails is aborted straight to
//! `Stopped` from `Created` or `Starting`.

use std::fmt;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Created => "created",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: State,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Created,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Move to `to` if the transition is allowed.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError` and leaves the state unchanged otherwise.
    pub fn transition(&mut self, to: State) -> Result<(), LifecycleError> {
        let allowed = matches!(
            (self.state, to),
            (State::Created, State::Starting)
                | (State::Starting, State::Running)
                | (State::Running, State::Stopping)
                | (State::Stopping, State::Stopped)
                | (State::Created | State::Starting, State::Stopped)
        );

        if !allowed {
            return Err(LifecycleError {
                from: self.state,
                to,
            });
        }

        tracing::debug!("Lifecycle {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), State::Created);

        for next in [
            State::Starting,
            State::Running,
            State::Stopping,
            State::Stopped,
        ] {
            lifecycle.transition(next).unwrap();
            assert_eq!(lifecycle.state(), next);
        }
    }

    #[test]
    fn test_stopped_is_terminal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(State::Stopped).unwrap();

        for next in [
            State::Created,
            State::Starting,
            State::Running,
            State::Stopping,
            State::Stopped,
        ] {
            let err = lifecycle.transition(next).unwrap_err();
            assert_eq!(err.from, State::Stopped);
            assert_eq!(lifecycle.state(), State::Stopped);
        }
    }

    #[test]
    fn test_cannot_skip_starting() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.transition(State::Running).unwrap_err();
        assert_eq!(
            err,
            LifecycleError {
                from: State::Created,
                to: State::Running
            }
        );
    }

    #[test]
    fn test_stop_requires_running() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(State::Starting).unwrap();
        assert!(lifecycle.transition(State::Stopping).is_err());
        assert!(!lifecycle.is_running());
    }

    #[test]
    fn test_aborted_startup() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(State::Starting).unwrap();
        lifecycle.transition(State::Stopped).unwrap();
        assert_eq!(lifecycle.state(), State::Stopped);
    }
}
