//! Error types for Prism
//!
//! Centralized error handling using thiserror. State-integrity violations that
//! are expected under concurrent heartbeats get their own `RejectReason` enum so
//! callers can pattern-match on the outcome instead of parsing error strings.

use thiserror::Error;

/// Raised when a state transition is attempted against a task whose live state
/// does not match the transition's precondition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Stored state claims running but date_start was never set
    #[error("cannot determine task state: running without date_start")]
    Indeterminate,

    /// Live state did not match the transition's expected source state
    #[error("expected state {expected} but task is {actual}")]
    WrongState {
        expected: crate::task::TaskState,
        actual: crate::task::TaskState,
    },
}

/// Why a state-change save was rejected.
///
/// `AlreadyPickedUp` is the sentinel for a dependent class whose task is mid-run:
/// the queue heartbeat rolls back the whole batch and retries next tick. The
/// dirty/no-op variants are ordinary races between heartbeats and are logged at
/// a low level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// A dependent task is still running; the batch must be retried later
    #[error("task already picked up by an execute heartbeat")]
    AlreadyPickedUp,

    /// The task row disappeared between fetch and save
    #[error("task no longer exists")]
    Missing,

    /// Free fields drifted and this transition does not tolerate drift
    #[error("task data changed under us and this transition does not allow it")]
    DirtyNotAllowed,

    /// The transition was a no-op and this transition requires a real change
    #[error("task state did not change")]
    StateNotChanged,

    /// Storage failure while holding the write lock
    #[error("storage failure during state change: {0}")]
    Fatal(String),
}

impl RejectReason {
    /// Rejections that are routine races between concurrent heartbeats.
    pub fn is_expected_race(&self) -> bool {
        matches!(self, RejectReason::DirtyNotAllowed | RejectReason::StateNotChanged)
    }
}

/// All error types that can occur in Prism
#[derive(Debug, Error)]
pub enum PrismError {
    /// Configuration value failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task state machine violation
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// State-change save rejected
    #[error("State change rejected: {0}")]
    Rejected(#[from] RejectReason),

    /// SQLite error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Prism operations
pub type Result<T> = std::result::Result<T, PrismError>;
