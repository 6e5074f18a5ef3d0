//! # taskbus — durable task coordination for agent runtimes
//!
//! A durable task manager coupled to a scoped event bus. An agent spawns
//! long-running tasks (typically sandboxed code execution), awaits them for
//! a bounded time, and while waiting can be woken by out-of-band
//! high-priority events — interrupts, messages, signals — without losing the
//! eventual result.
//!
//! ## Pieces
//!
//! - [`store`] — persistence for `tasks`, the append-only `task_updates`
//!   log, `events`, and per-reader read-receipts. [`store::MemoryStore`]
//!   for tests, [`store::SqliteStore`] (feature `sqlite`, default) for
//!   durable deployments. Conditional status updates are the concurrency
//!   primitive; writes retry briefly under contention.
//! - [`bus`] — persistent pub/sub. Every event lives on one stream
//!   (`task_input`, `task_output`, `signals`, `errors`, `external`,
//!   `messages`) and is addressed to one `(scope_type, scope_id)` pair.
//!   Push, scoped list, read-with-receipt, ack, and live subscriptions.
//! - [`manager`] — the task lifecycle state machine
//!   (`queued → running → {completed, failed, cancelled}`) plus the await
//!   coordination loop. Every transition lands one update row and one bus
//!   event.
//! - [`surface`] — the JSON-in/JSON-out adapter a tool-calling layer binds
//!   to: `exec`, `await_task`, `send_task`, `cancel_task`, `kill_task`.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskbus::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> taskbus::error::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let bus = Arc::new(EventBus::new(store.clone()));
//! let manager = TaskManager::with_bus(store, bus);
//! let ctx = CallContext::new();
//!
//! // Spawn work and let a worker claim it.
//! let task = manager
//!     .spawn(&ctx, TaskSpec::new("exec").with_owner("agent-a"))
//!     .await?;
//! let claimed = manager.claim_queued(&ctx, "exec", 1).await?;
//! assert_eq!(claimed[0].id, task.id);
//!
//! // Finish it and observe the result.
//! let mut result = taskbus::types::JsonMap::new();
//! result.insert("ok".into(), serde_json::Value::Bool(true));
//! manager.complete(&ctx, &task.id, result).await?;
//!
//! match manager.await_task(&ctx, &task.id, Duration::from_secs(2)).await? {
//!     AwaitOutcome::Terminal(task) => assert_eq!(task.status, TaskStatus::Completed),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Wake events
//!
//! An await subscribes to the wake streams and is released by any unread
//! event carrying `metadata.priority` of `wake` or `interrupt` whose scope
//! matches the task's await targets (`owner` / `metadata.notify_target`).
//! A short wake-grace window lets a near-simultaneous completion win, and a
//! task's own terminal `task_output` event is left unread when it is what
//! released the await, so later context reconstruction still finds it.

pub mod builders;
pub mod bus;
pub mod context;
pub mod error;
pub mod manager;
pub mod store;
pub mod surface;
pub mod types;

/// Re-exports of the commonly used types.
///
/// ```
/// use taskbus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::builders::{TaskManagerBuilder, TaskSpecBuilder};
    pub use crate::bus::{EventBus, ListOptions, Subscription};
    pub use crate::context::CallContext;
    pub use crate::error::{Error, Result};
    pub use crate::manager::{AwaitAnyOutcome, AwaitOutcome, TaskManager};
    pub use crate::store::{MemoryStore, Store, TaskFilter};
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStore;
    pub use crate::surface::ToolSurface;
    pub use crate::types::{
        kinds, streams, Event, EventInput, ListOrder, Priority, Task, TaskSpec, TaskStatus,
        TaskUpdate,
    };
}

pub use error::{Error, Result};
pub use types::{Event, EventInput, Priority, Task, TaskSpec, TaskStatus, TaskUpdate};
