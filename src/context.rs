//! Per-call context — ambient values threaded explicitly through every
//! operation instead of living in process-wide state.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

/// Ambient values for one manager or surface call.
///
/// Carries the caller's identity (`task_id`, `parent_task_id`), the set of
/// wake event ids the caller has already observed and must not be re-woken
/// by, and a cancellation token. Cloning is cheap; clones share the token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Id of the task the caller itself is running as, if any.
    pub task_id: Option<String>,

    /// Id of the caller's parent task; fills `metadata.parent_id` on spawn
    /// when the spec does not set one.
    pub parent_task_id: Option<String>,

    /// Wake event ids to ack-and-skip instead of returning from an await.
    /// Suppresses self-wake loops when the caller re-awaits right after
    /// observing a wake event.
    pub ignored_wake_event_ids: HashSet<String>,

    cancel: CancellationToken,
}

impl CallContext {
    /// A fresh context with no caller identity and no cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the caller's task id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the caller's parent task id.
    pub fn with_parent_task_id(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    /// Add a wake event id the awaiter must ack and skip.
    pub fn ignore_wake_event(mut self, event_id: impl Into<String>) -> Self {
        self.ignored_wake_event_ids.insert(event_id.into());
        self
    }

    /// Attach an externally controlled cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The context's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
