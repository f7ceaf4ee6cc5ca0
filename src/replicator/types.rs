//! Replicator state types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                shutdown()
//! Created ──────────► Running ──────────────► ShuttingDown
//!    │                                             │
//!    │ shutdown()                                  │ driver drained
//!    ▼                                             ▼
//! Stopped ◄────────────────────────────────────────┘
//! ```
//!
//! - **Created**: built from config, no driver task yet.
//! - **Running**: driver task is waiting for changes or running passes.
//! - **ShuttingDown**: shutdown signalled, waiting for the driver to finish.
//! - **Stopped**: driver finished and peer connections dropped.

/// State of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created but not started.
    Created,

    /// Driver task running.
    Running,

    /// Draining the driver task.
    ShuttingDown,

    /// Stopped. Safe to drop.
    Stopped,
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorState::Created => write!(f, "Created"),
            ReplicatorState::Running => write!(f, "Running"),
            ReplicatorState::ShuttingDown => write!(f, "ShuttingDown"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ReplicatorState {
    /// Check if the driver is (or may still be) running.
    pub fn is_running(&self) -> bool {
        matches!(self, ReplicatorState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ReplicatorState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ReplicatorState::Created.to_string(), "Created");
        assert_eq!(ReplicatorState::Running.to_string(), "Running");
        assert_eq!(ReplicatorState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(ReplicatorState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ReplicatorState::Running.is_running());
        assert!(!ReplicatorState::ShuttingDown.is_running());
        assert!(ReplicatorState::Stopped.is_stopped());
        assert!(!ReplicatorState::Created.is_stopped());
    }
}
