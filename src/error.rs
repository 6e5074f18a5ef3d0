//! Error types for the task manager and event bus.
//!
//! A single crate-wide [`Error`] enum covers store failures, lifecycle
//! violations, and validation problems. Await timeouts and wake events are
//! deliberately *not* errors — they are ordinary outcomes carried by
//! [`AwaitOutcome`](crate::manager::AwaitOutcome) so callers pattern-match
//! instead of downcasting.

use crate::types::TaskStatus;

/// Unified error type for all task manager and event bus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    NotFound(String),

    /// A lifecycle transition was attempted from a state that does not
    /// permit it (terminal states are absorbing; `running` is only reachable
    /// from `queued`).
    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidStatusTransition {
        /// The task whose transition was rejected.
        task_id: String,
        /// Status the task held when the transition was attempted.
        from: TaskStatus,
        /// Status the caller asked for.
        to: TaskStatus,
    },

    /// An operation that needs the event bus was called on a manager built
    /// without one.
    #[error("event bus unavailable")]
    BusUnavailable,

    /// A required field was missing or malformed.
    #[error("validation: {0}")]
    Validation(String),

    /// The store stayed busy through the bounded retry window.
    #[error("store busy after retries")]
    StoreBusy,

    /// A store operation failed. The message carries a context prefix naming
    /// the failing step (`"insert task: …"`, `"decode metadata: …"`).
    #[error("store: {0}")]
    Store(String),

    /// JSON encoding or decoding failed.
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// The caller's context was cancelled before the operation finished.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience result type for taskbus operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a `NotFound` for a task id.
    pub fn not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound(task_id.into())
    }

    /// Create a `Validation` error with a message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a `Store` error with a context-prefixed message.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create an `InvalidStatusTransition`.
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Self {
        Self::InvalidStatusTransition {
            task_id: task_id.into(),
            from,
            to,
        }
    }

    /// Returns `true` when this error is an invalid lifecycle transition.
    ///
    /// Callers racing on conditional updates use this to tell a lost race
    /// apart from a hard failure.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Error::InvalidStatusTransition { .. })
    }

    /// Returns `true` when this error means the task does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_formats_states() {
        let err = Error::invalid_transition("t1", TaskStatus::Completed, TaskStatus::Failed);
        assert!(err.is_invalid_transition());
        assert_eq!(
            err.to_string(),
            "invalid status transition for task t1: completed -> failed"
        );
    }

    #[test]
    fn store_error_keeps_context_prefix() {
        let err = Error::store("encode payload: unexpected end of input");
        assert!(err.to_string().contains("encode payload"));
    }

    #[test]
    fn not_found_detector() {
        assert!(Error::not_found("missing").is_not_found());
        assert!(!Error::BusUnavailable.is_not_found());
    }
}
