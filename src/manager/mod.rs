//! Task manager — the lifecycle state machine over the store, with every
//! transition mirrored onto the event bus.
//!
//! All mutual exclusion comes from conditional store updates
//! (`WHERE id = ? AND status = ?`); the manager itself holds no task state.
//! Bus pushes made as side effects of writes are fire-and-forget: the
//! durable row is the source of truth and a failed push only costs a live
//! notification, which awaiters recover by polling.

mod awaiter;

pub use awaiter::{AwaitAnyOutcome, AwaitOutcome};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, ListOptions};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::store::{StatusChange, Store, TaskFilter, UpdateFilter};
use crate::types::{
    kinds, ordered_id, streams, task_id, EventInput, JsonMap, Priority, Task, TaskSpec,
    TaskStatus, TaskUpdate,
};

/// Default await deadline when the caller passes a zero timeout.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Await loop re-polls the task at this cadence even without bus traffic.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Debounce window letting a near-simultaneous completion win over a wake.
pub const DEFAULT_WAKE_GRACE: Duration = Duration::from_millis(200);
/// Default `list` limit.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Tunable timing knobs; see [`TaskManagerBuilder`](crate::builders::TaskManagerBuilder).
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Deadline used when an await is called with a zero timeout.
    pub default_await_timeout: Duration,
    /// Await poll cadence.
    pub poll_interval: Duration,
    /// Wake debounce window.
    pub wake_grace: Duration,
    /// Default task-list limit.
    pub list_limit: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_await_timeout: DEFAULT_AWAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wake_grace: DEFAULT_WAKE_GRACE,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}

/// The task manager.
pub struct TaskManager {
    store: Arc<dyn Store>,
    bus: Option<Arc<EventBus>>,
    options: ManagerOptions,
}

impl TaskManager {
    /// A manager without a bus: all operations except `await_task`,
    /// `await_any`, and `ack_task_output` work store-only.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            bus: None,
            options: ManagerOptions::default(),
        }
    }

    /// A manager wired to an event bus.
    pub fn with_bus(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus: Some(bus),
            options: ManagerOptions::default(),
        }
    }

    pub(crate) fn from_parts(
        store: Arc<dyn Store>,
        bus: Option<Arc<EventBus>>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            store,
            bus,
            options,
        }
    }

    /// The attached bus, if any.
    pub fn bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    pub(crate) fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub(crate) fn require_bus(&self) -> Result<&Arc<EventBus>> {
        self.bus.as_ref().ok_or(Error::BusUnavailable)
    }

    fn ensure_live(ctx: &CallContext) -> Result<()> {
        if ctx.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Spawning and lookup
    // ------------------------------------------------------------------

    /// Create a task in status `queued`.
    ///
    /// Requires `spec.task_type`. Records a `spawn` update and announces the
    /// task on `task_input` scoped to its input target. The caller's
    /// `parent_task_id` fills `metadata.parent_id` when the spec left it
    /// unset.
    pub async fn spawn(&self, ctx: &CallContext, spec: TaskSpec) -> Result<Task> {
        Self::ensure_live(ctx)?;
        if spec.task_type.is_empty() {
            return Err(Error::validation("task type is required"));
        }

        let mut metadata = spec.metadata;
        if !metadata.contains_key("parent_id") {
            if let Some(parent) = ctx.parent_task_id.as_deref() {
                metadata.insert("parent_id".into(), Value::String(parent.into()));
            }
        }

        let now = Utc::now();
        let prefix = spec.name.as_deref().unwrap_or(&spec.task_type);
        let task = Task {
            id: task_id(prefix),
            task_type: spec.task_type,
            status: TaskStatus::Queued,
            owner: spec.owner,
            metadata,
            payload: spec.payload,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_task(&task).await?;
        self.append_update(&task, kinds::SPAWN, task.payload.clone(), false)
            .await?;

        self.push_fire_and_forget(
            EventInput::new(streams::TASK_INPUT)
                .scoped("task", task.input_target())
                .subject(kinds::SPAWN)
                .meta("action", kinds::SPAWN)
                .meta("task_id", task.id.as_str())
                .meta("type", task.task_type.as_str())
                .payload(task.payload.clone())
                .source(task.id.as_str()),
        )
        .await;

        info!(task_id = %task.id, task_type = %task.task_type, "task spawned");
        Ok(task)
    }

    /// Load a task; [`Error::NotFound`] when it does not exist.
    pub async fn get(&self, ctx: &CallContext, task_id: &str) -> Result<Task> {
        Self::ensure_live(ctx)?;
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found(task_id))
    }

    /// List tasks by type/status/owner, newest first. The limit defaults to
    /// the manager's configured list limit.
    pub async fn list(&self, ctx: &CallContext, mut filter: TaskFilter) -> Result<Vec<Task>> {
        Self::ensure_live(ctx)?;
        if filter.limit.is_none() {
            filter.limit = Some(self.options.list_limit);
        }
        self.store.list_tasks(&filter).await
    }

    /// Tasks whose `metadata.parent_id` names the given task.
    pub async fn list_children(&self, ctx: &CallContext, task_id: &str) -> Result<Vec<Task>> {
        Self::ensure_live(ctx)?;
        self.store
            .list_tasks(&TaskFilter {
                parent_id: Some(task_id.to_string()),
                oldest_first: true,
                ..Default::default()
            })
            .await
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    /// Conditional `queued → running`; idempotent when already running.
    pub async fn mark_running(&self, ctx: &CallContext, task_id: &str) -> Result<Task> {
        self.transition(ctx, task_id, TaskStatus::Running, None, kinds::STARTED, JsonMap::new())
            .await
    }

    /// Terminal transition into `completed` with a result map.
    pub async fn complete(
        &self,
        ctx: &CallContext,
        task_id: &str,
        result: JsonMap,
    ) -> Result<Task> {
        self.transition(
            ctx,
            task_id,
            TaskStatus::Completed,
            Some(result.clone()),
            kinds::COMPLETED,
            result,
        )
        .await
    }

    /// Terminal transition into `failed` with a reason.
    pub async fn fail(&self, ctx: &CallContext, task_id: &str, reason: &str) -> Result<Task> {
        let mut result = JsonMap::new();
        result.insert("error".into(), Value::String(reason.into()));
        self.transition(
            ctx,
            task_id,
            TaskStatus::Failed,
            Some(result.clone()),
            kinds::FAILED,
            result,
        )
        .await
    }

    /// Cancel a task and, depth-first, every descendant reachable through
    /// `metadata.parent_id`.
    pub async fn cancel(
        &self,
        ctx: &CallContext,
        task_id: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let root = self.get(ctx, task_id).await?;
        let mut visited = HashSet::new();
        self.cancel_tree(ctx, root, reason.map(str::to_string), false, true, &mut visited)
            .await?;
        self.get(ctx, task_id).await
    }

    /// Like [`cancel`](Self::cancel), but records `killed` updates and sets
    /// `result.killed = true` on every task it stops.
    pub async fn kill(
        &self,
        ctx: &CallContext,
        task_id: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let root = self.get(ctx, task_id).await?;
        let mut visited = HashSet::new();
        self.cancel_tree(ctx, root, reason.map(str::to_string), true, true, &mut visited)
            .await?;
        self.get(ctx, task_id).await
    }

    /// Shared conditional-transition path. Same-to-same is a no-op;
    /// transitions out of a terminal state raise
    /// [`Error::InvalidStatusTransition`]; a lost race reloads and
    /// re-evaluates, so concurrent winners are decided by the store.
    async fn transition(
        &self,
        ctx: &CallContext,
        task_id: &str,
        target: TaskStatus,
        result: Option<JsonMap>,
        kind: &str,
        payload: JsonMap,
    ) -> Result<Task> {
        let mut task = self.get(ctx, task_id).await?;
        let error = result.as_ref().and_then(extract_error);
        loop {
            if task.status == target {
                return Ok(task);
            }
            if task.status.is_terminal()
                || (target == TaskStatus::Running && task.status != TaskStatus::Queued)
            {
                return Err(Error::invalid_transition(task_id, task.status, target));
            }
            let change = StatusChange {
                task_id: task_id.to_string(),
                expected: task.status,
                next: target,
                result: result.clone(),
                error: error.clone(),
                updated_at: Utc::now(),
            };
            if self.store.update_task_status(&change).await? {
                break;
            }
            debug!(task_id, from = %task.status, to = %target, "lost transition race, reloading");
            task = self.get(ctx, task_id).await?;
        }

        let task = self.get(ctx, task_id).await?;
        self.append_update(&task, kind, payload, true).await?;
        debug!(task_id, status = %task.status, kind, "transition recorded");
        Ok(task)
    }

    fn cancel_tree<'a>(
        &'a self,
        ctx: &'a CallContext,
        task: Task,
        reason: Option<String>,
        kill: bool,
        root: bool,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !visited.insert(task.id.clone()) {
                return Ok(());
            }
            Self::ensure_live(ctx)?;

            // Command first so an executing agent sees the interrupt even if
            // the transition below loses a race.
            let action = if kill { "kill" } else { "cancel" };
            let mut command = EventInput::new(streams::SIGNALS)
                .scoped("task", task.input_target())
                .subject(action)
                .meta("action", action)
                .meta("task_id", task.id.as_str())
                .priority(Priority::Interrupt)
                .source(task.id.as_str());
            if let Some(reason) = reason.as_deref() {
                command = command.meta("reason", reason);
            }
            self.push_fire_and_forget(command).await;

            let mut result = JsonMap::new();
            if let Some(reason) = reason.as_deref() {
                result.insert("reason".into(), Value::String(reason.into()));
            }
            if kill {
                result.insert("killed".into(), Value::Bool(true));
            }
            let kind = if kill { kinds::KILLED } else { kinds::CANCELLED };
            match self
                .transition(ctx, &task.id, TaskStatus::Cancelled, Some(result.clone()), kind, result)
                .await
            {
                Ok(_) => {}
                // Already-terminal descendants are left as they are; the
                // subtree below them may still hold live tasks.
                Err(err) if err.is_invalid_transition() && !root => {
                    debug!(task_id = %task.id, "descendant already terminal, skipping");
                }
                Err(err) => return Err(err),
            }

            let children = self
                .store
                .list_tasks(&TaskFilter {
                    parent_id: Some(task.id.clone()),
                    oldest_first: true,
                    ..Default::default()
                })
                .await?;
            for child in children {
                self.cancel_tree(ctx, child, reason.clone(), kill, false, &mut *visited)
                    .await?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Input, progress, and the update log
    // ------------------------------------------------------------------

    /// Deliver input to a task: a `task_input` event scoped to the input
    /// target plus an `input` update row.
    pub async fn send(&self, ctx: &CallContext, task_id: &str, input: JsonMap) -> Result<()> {
        let task = self.get(ctx, task_id).await?;
        self.push_fire_and_forget(
            EventInput::new(streams::TASK_INPUT)
                .scoped("task", task.input_target())
                .subject(kinds::INPUT)
                .meta("action", kinds::INPUT)
                .meta("task_id", task.id.as_str())
                .payload(input.clone())
                .source(task.id.as_str()),
        )
        .await;
        self.append_update(&task, kinds::INPUT, input, false).await?;
        Ok(())
    }

    /// Append an update row, bump `updated_at`, and push the corresponding
    /// `task_output` event scoped to the notify target.
    ///
    /// Priority: `payload.priority` when set, otherwise `wake` for terminal
    /// kinds and `normal` for everything else.
    pub async fn record_update(
        &self,
        ctx: &CallContext,
        task_id: &str,
        kind: &str,
        payload: JsonMap,
    ) -> Result<TaskUpdate> {
        let task = self.get(ctx, task_id).await?;
        self.append_update(&task, kind, payload, true).await
    }

    /// Update-log rows for a task, ascending by id.
    pub async fn list_updates(
        &self,
        ctx: &CallContext,
        task_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TaskUpdate>> {
        Self::ensure_live(ctx)?;
        self.store
            .list_updates(&UpdateFilter {
                task_id: task_id.to_string(),
                limit,
                ..Default::default()
            })
            .await
    }

    /// Update-log rows with `id > after_id`, optionally kind-filtered.
    pub async fn list_updates_since(
        &self,
        ctx: &CallContext,
        task_id: &str,
        after_id: &str,
        kind: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<TaskUpdate>> {
        Self::ensure_live(ctx)?;
        self.store
            .list_updates(&UpdateFilter {
                task_id: task_id.to_string(),
                after_id: Some(after_id.to_string()),
                kind: kind.map(str::to_string),
                limit,
            })
            .await
    }

    /// Receipt every unread `task_output` event for a task on behalf of
    /// `reader`. Used after a result was returned through a direct channel
    /// so the next context refresh does not redeliver it.
    pub async fn ack_task_output(
        &self,
        ctx: &CallContext,
        task_id: &str,
        reader: &str,
    ) -> Result<usize> {
        let bus = self.require_bus()?;
        let task = self.get(ctx, task_id).await?;
        let events = bus
            .list(
                streams::TASK_OUTPUT,
                &ListOptions {
                    scope_type: "global".into(),
                    scope_id: "*".into(),
                    reader: Some(reader.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let unread: Vec<String> = events
            .iter()
            .filter(|e| e.source_id == task.id && !e.read)
            .map(|e| e.id.clone())
            .collect();
        bus.ack(streams::TASK_OUTPUT, &unread, reader).await?;
        debug!(task_id, reader, count = unread.len(), "task output acked");
        Ok(unread.len())
    }

    // ------------------------------------------------------------------
    // Claiming
    // ------------------------------------------------------------------

    /// Atomically claim up to `limit` queued tasks of one type, oldest
    /// first. Each claim is a conditional `queued → running` update; tasks
    /// lost to a concurrent claimer are dropped from the result, so two
    /// claimers always end up with disjoint sets.
    pub async fn claim_queued(
        &self,
        ctx: &CallContext,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<Task>> {
        Self::ensure_live(ctx)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let queued = self
            .store
            .list_tasks(&TaskFilter {
                task_type: Some(task_type.to_string()),
                status: Some(TaskStatus::Queued),
                oldest_first: true,
                limit: Some(limit),
                ..Default::default()
            })
            .await?;

        let mut claimed = Vec::new();
        for task in queued {
            let change = StatusChange {
                task_id: task.id.clone(),
                expected: TaskStatus::Queued,
                next: TaskStatus::Running,
                result: None,
                error: None,
                updated_at: Utc::now(),
            };
            if !self.store.update_task_status(&change).await? {
                debug!(task_id = %task.id, "claim lost to concurrent worker");
                continue;
            }
            let task = self.get(ctx, &task.id).await?;
            self.append_update(&task, kinds::STARTED, JsonMap::new(), true)
                .await?;
            claimed.push(task);
        }
        Ok(claimed)
    }

    // ------------------------------------------------------------------
    // Internals shared with the awaiter
    // ------------------------------------------------------------------

    pub(crate) async fn load(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found(task_id))
    }

    /// Insert an update row and bump `updated_at`; with `notify`, also push
    /// the matching `task_output` event.
    pub(crate) async fn append_update(
        &self,
        task: &Task,
        kind: &str,
        payload: JsonMap,
        notify: bool,
    ) -> Result<TaskUpdate> {
        let now = Utc::now();
        let update = TaskUpdate {
            id: ordered_id(),
            task_id: task.id.clone(),
            kind: kind.to_string(),
            payload,
            created_at: now,
        };
        self.store.insert_update(&update).await?;
        self.store.touch_task(&task.id, now).await?;

        if notify {
            let priority = update
                .payload
                .get("priority")
                .and_then(Value::as_str)
                .map(Priority::parse)
                .unwrap_or_else(|| {
                    if kinds::is_terminal(kind) {
                        Priority::Wake
                    } else {
                        Priority::Normal
                    }
                });
            self.push_fire_and_forget(
                EventInput::new(streams::TASK_OUTPUT)
                    .scoped("task", task.notify_target())
                    .subject(kind)
                    .meta("task_id", task.id.as_str())
                    .meta("kind", kind)
                    .priority(priority)
                    .payload(update.payload.clone())
                    .source(task.id.as_str()),
            )
            .await;
        }
        Ok(update)
    }

    /// Push without surfacing errors: the durable write already succeeded
    /// and the notification is recoverable through list/read.
    pub(crate) async fn push_fire_and_forget(&self, input: EventInput) {
        let Some(bus) = self.bus.as_ref() else {
            return;
        };
        if let Err(err) = bus.push(input).await {
            warn!(error = %err, "bus push failed, durable row remains authoritative");
        }
    }
}

/// Error string for the task row: `result.error`, falling back to
/// `result.reason`.
fn extract_error(result: &JsonMap) -> Option<String> {
    result
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| result.get("reason").and_then(Value::as_str))
        .map(str::to_string)
}
