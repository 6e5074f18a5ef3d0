//! Persistence layer — tasks, update log, events, and read-receipts.
//!
//! The [`Store`] trait is the seam between the manager/bus and the physical
//! layout. Two implementations ship: [`MemoryStore`] for tests and
//! short-lived runtimes, and [`SqliteStore`] (feature `sqlite`) for durable
//! deployments.
//!
//! Every trait method is atomic. The conditional status update is the
//! concurrency primitive the whole state machine rests on: concurrent
//! writers race on `WHERE id = ? AND status = ?` and the store arbitrates.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Event, JsonMap, ListOrder, Task, TaskStatus, TaskUpdate};

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to one task type.
    pub task_type: Option<String>,

    /// Restrict to one status.
    pub status: Option<TaskStatus>,

    /// Restrict to one owner.
    pub owner: Option<String>,

    /// Restrict to tasks whose `metadata.parent_id` equals this id.
    pub parent_id: Option<String>,

    /// Maximum rows returned.
    pub limit: Option<usize>,

    /// When set, order oldest-first (claim order) instead of the default
    /// newest-first listing order.
    pub oldest_first: bool,
}

/// Filter for update-log queries. Results are always ascending by id.
#[derive(Debug, Clone, Default)]
pub struct UpdateFilter {
    /// The task whose log to read.
    pub task_id: String,

    /// Only rows with `id > after_id`.
    pub after_id: Option<String>,

    /// Only rows of this kind.
    pub kind: Option<String>,

    /// Maximum rows returned.
    pub limit: Option<usize>,
}

/// Filter for event listings.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// The stream to list; required.
    pub stream: String,

    /// Scope query; `None` means any scope. See
    /// [`scope_query_matches`](crate::types::scope_query_matches) for the
    /// wildcard and broadcast rules.
    pub scope: Option<(String, String)>,

    /// Maximum rows returned (applied after scope filtering).
    pub limit: Option<usize>,

    /// Listing order; default newest-first.
    pub order: ListOrder,
}

/// A conditional status update: applied only while the task still holds
/// `expected`. Returns whether a row changed.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Target task.
    pub task_id: String,

    /// Status the row must currently hold.
    pub expected: TaskStatus,

    /// Status to set.
    pub next: TaskStatus,

    /// Result map to store, for terminal transitions.
    pub result: Option<JsonMap>,

    /// Error string to store.
    pub error: Option<String>,

    /// New `updated_at`; implementations clamp to keep the column
    /// monotonically non-decreasing.
    pub updated_at: DateTime<Utc>,
}

/// Storage backend for tasks, update logs, events, and read-receipts.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new task row. Fails if the id already exists.
    async fn insert_task(&self, task: &Task) -> Result<()>;

    /// Load a task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// List tasks matching the filter, newest-first unless `oldest_first`.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Apply a conditional status update; `Ok(false)` means the guard did
    /// not match (row missing or status moved on).
    async fn update_task_status(&self, change: &StatusChange) -> Result<bool>;

    /// Bump a task's `updated_at` (kept monotonically non-decreasing).
    async fn touch_task(&self, task_id: &str, updated_at: DateTime<Utc>) -> Result<()>;

    /// Append one update-log row.
    async fn insert_update(&self, update: &TaskUpdate) -> Result<()>;

    /// Read the update log, ascending by id.
    async fn list_updates(&self, filter: &UpdateFilter) -> Result<Vec<TaskUpdate>>;

    /// Insert one event row.
    async fn insert_event(&self, event: &Event) -> Result<()>;

    /// Load full events by id within one stream, ordered by `(created_at,
    /// id)` ascending. Unknown ids are silently absent.
    async fn get_events(&self, stream: &str, ids: &[String]) -> Result<Vec<Event>>;

    /// List events matching the filter, ordered per `filter.order`.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// Which of `ids` the reader already holds receipts for. Read-only.
    async fn read_receipts(&self, ids: &[String], reader: &str) -> Result<HashSet<String>>;

    /// Atomically insert receipts for every `(id, reader)` pair that lacks
    /// one and return the ids that already had a receipt.
    async fn claim_receipts(
        &self,
        ids: &[String],
        reader: &str,
        read_at: DateTime<Utc>,
    ) -> Result<HashSet<String>>;
}
