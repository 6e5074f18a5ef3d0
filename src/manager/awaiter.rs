//! Await coordination — bounded waits released by completion, timeout, or
//! out-of-band wake events.
//!
//! An awaiter blocks on three sources at once: the deadline, a poll tick,
//! and one live bus subscription over the wake streams. Pre-existing unread
//! wake events are drained before blocking so a wake pushed moments before
//! the await still releases it. A task's own terminal `task_output` event is
//! deliberately left unread when it is the thing that released the await —
//! later context reconstruction needs to find it.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{EventBus, ListOptions};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::types::{kinds, streams, Event, JsonMap, ListOrder, Priority, Task};

use super::TaskManager;

/// How a single-task await was released.
#[derive(Debug, Clone)]
pub enum AwaitOutcome {
    /// The task reached a terminal status.
    Terminal(Task),
    /// The deadline expired; carries the still-pending task.
    TimedOut(Task),
    /// A wake or interrupt event released the wait before completion.
    Woken {
        /// The task as of the wake (may itself be terminal when a foreign
        /// event and the completion raced).
        task: Task,
        /// The releasing event.
        event: Event,
        /// The event's classified priority.
        priority: Priority,
    },
}

impl AwaitOutcome {
    /// The awaited task, however the wait ended.
    pub fn task(&self) -> &Task {
        match self {
            AwaitOutcome::Terminal(task)
            | AwaitOutcome::TimedOut(task)
            | AwaitOutcome::Woken { task, .. } => task,
        }
    }

    /// Whether the wait ended at the deadline.
    pub fn timed_out(&self) -> bool {
        matches!(self, AwaitOutcome::TimedOut(_))
    }
}

/// How a fan-in await was released.
#[derive(Debug, Clone)]
pub enum AwaitAnyOutcome {
    /// One of the awaited tasks reached a terminal status.
    Terminal {
        /// The finished task.
        task: Task,
        /// Ids of the awaited tasks still pending.
        pending: Vec<String>,
    },
    /// The deadline expired with every task still pending.
    TimedOut {
        /// Ids of the awaited tasks still pending.
        pending: Vec<String>,
    },
    /// A wake or interrupt event released the wait.
    Woken {
        /// The releasing event.
        event: Event,
        /// The event's classified priority.
        priority: Priority,
        /// Ids of the awaited tasks still pending.
        pending: Vec<String>,
    },
}

/// Matching of an event's scope against an awaiter's target set.
fn event_matches_targets(event: &Event, targets: &BTreeSet<String>) -> bool {
    match event.scope_type.as_str() {
        "task" => !event.scope_id.is_empty() && targets.contains(&event.scope_id),
        "" | "global" => {
            event.scope_id.is_empty()
                || event.scope_id == "*"
                || targets.contains(&event.scope_id)
        }
        _ => {
            event.scope_id.is_empty()
                || event.scope_id == "*"
                || targets.contains(&event.scope_id)
        }
    }
}

/// Whether `event` is `task`'s own terminal `task_output` event.
fn is_own_terminal_output(task: &Task, event: &Event) -> bool {
    event.stream == streams::TASK_OUTPUT
        && event.source_id == task.id
        && event.update_kind().is_some_and(kinds::is_terminal)
}

fn reader_for(targets: &BTreeSet<String>) -> String {
    targets
        .iter()
        .next()
        .cloned()
        .unwrap_or_else(|| "runtime".to_string())
}

impl TaskManager {
    fn effective_timeout(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.options().default_await_timeout
        } else {
            timeout
        }
    }

    /// Wait for a task to finish, for at most `timeout` (zero means the
    /// configured default).
    ///
    /// Returns [`AwaitOutcome::Terminal`] when the task completes,
    /// [`AwaitOutcome::TimedOut`] at the deadline (recording an
    /// `await_timeout` update so the give-up is itself observable), or
    /// [`AwaitOutcome::Woken`] when a wake-priority event scoped to one of
    /// the task's await targets arrives. Requires a bus.
    pub async fn await_task(
        &self,
        ctx: &CallContext,
        task_id: &str,
        timeout: Duration,
    ) -> Result<AwaitOutcome> {
        let bus = self.require_bus()?.clone();
        let deadline = Instant::now() + self.effective_timeout(timeout);

        let task = self.load(task_id).await?;
        let targets = task.await_targets();
        let reader = reader_for(&targets);
        // Single subscription for the whole wait.
        let mut sub = bus.subscribe(&streams::WAKE);

        debug!(task_id, reader = %reader, ?targets, "awaiting task");

        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let task = self.load(task_id).await?;
            if task.status.is_terminal() {
                return Ok(AwaitOutcome::Terminal(task));
            }

            if let Some(event) = self.drain_wake_events(ctx, &bus, &targets, &reader).await? {
                return self.settle_wake(ctx, &bus, task_id, &reader, event).await;
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    let task = self.load(task_id).await?;
                    if task.status.is_terminal() {
                        return Ok(AwaitOutcome::Terminal(task));
                    }
                    self.append_update(&task, kinds::AWAIT_TIMEOUT, JsonMap::new(), true)
                        .await?;
                    debug!(task_id, "await deadline expired");
                    return Ok(AwaitOutcome::TimedOut(task));
                }
                _ = tokio::time::sleep(self.options().poll_interval) => {}
                received = sub.recv() => {
                    let Some(event) = received else {
                        // Feed gone; the poll tick keeps the loop honest.
                        tokio::time::sleep(self.options().poll_interval).await;
                        continue;
                    };
                    if !event.priority().wakes()
                        || !event_matches_targets(&event, &targets)
                    {
                        continue;
                    }
                    if ctx.ignored_wake_event_ids.contains(&event.id) {
                        bus.ack(&event.stream, std::slice::from_ref(&event.id), &reader)
                            .await?;
                        continue;
                    }
                    return self.settle_wake(ctx, &bus, task_id, &reader, event).await;
                }
            }
        }
    }

    /// Wait for any of `task_ids` to finish; otherwise identical to
    /// [`await_task`](Self::await_task) with the target union of all tasks.
    pub async fn await_any(
        &self,
        ctx: &CallContext,
        task_ids: &[String],
        timeout: Duration,
    ) -> Result<AwaitAnyOutcome> {
        let bus = self.require_bus()?.clone();
        if task_ids.is_empty() {
            return Err(Error::validation("task_ids is required"));
        }
        let deadline = Instant::now() + self.effective_timeout(timeout);

        let mut targets = BTreeSet::new();
        for id in task_ids {
            targets.extend(self.load(id).await?.await_targets());
        }
        let reader = reader_for(&targets);
        let mut sub = bus.subscribe(&streams::WAKE);

        debug!(count = task_ids.len(), reader = %reader, "awaiting any task");

        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let tasks = self.load_all(task_ids).await?;
            if let Some(outcome) = first_terminal(&tasks) {
                return Ok(outcome);
            }

            if let Some(event) = self.drain_wake_events(ctx, &bus, &targets, &reader).await? {
                return self.settle_any_wake(ctx, &bus, task_ids, &reader, event).await;
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    let tasks = self.load_all(task_ids).await?;
                    if let Some(outcome) = first_terminal(&tasks) {
                        return Ok(outcome);
                    }
                    for task in &tasks {
                        self.append_update(task, kinds::AWAIT_TIMEOUT, JsonMap::new(), true)
                            .await?;
                    }
                    return Ok(AwaitAnyOutcome::TimedOut {
                        pending: tasks.iter().map(|t| t.id.clone()).collect(),
                    });
                }
                _ = tokio::time::sleep(self.options().poll_interval) => {}
                received = sub.recv() => {
                    let Some(event) = received else {
                        tokio::time::sleep(self.options().poll_interval).await;
                        continue;
                    };
                    if !event.priority().wakes()
                        || !event_matches_targets(&event, &targets)
                    {
                        continue;
                    }
                    if ctx.ignored_wake_event_ids.contains(&event.id) {
                        bus.ack(&event.stream, std::slice::from_ref(&event.id), &reader)
                            .await?;
                        continue;
                    }
                    return self.settle_any_wake(ctx, &bus, task_ids, &reader, event).await;
                }
            }
        }
    }

    /// Resolve a wake for a single-task await: grace, re-check, then either
    /// a preserved completion or an acked wake.
    async fn settle_wake(
        &self,
        ctx: &CallContext,
        bus: &EventBus,
        task_id: &str,
        reader: &str,
        event: Event,
    ) -> Result<AwaitOutcome> {
        self.apply_wake_grace(ctx, &event).await?;

        let task = self.load(task_id).await?;
        if task.status.is_terminal() && is_own_terminal_output(&task, &event) {
            // The completion event stays unread for context reconstruction.
            debug!(task_id, event_id = %event.id, "completion won the grace window");
            return Ok(AwaitOutcome::Terminal(task));
        }

        bus.ack(&event.stream, std::slice::from_ref(&event.id), reader)
            .await?;
        let priority = event.priority();
        debug!(task_id, event_id = %event.id, %priority, "await released by wake event");
        Ok(AwaitOutcome::Woken {
            task,
            event,
            priority,
        })
    }

    /// Resolve a wake for a fan-in await: grace, re-scan, prefer a
    /// completion over the wake.
    async fn settle_any_wake(
        &self,
        ctx: &CallContext,
        bus: &EventBus,
        task_ids: &[String],
        reader: &str,
        event: Event,
    ) -> Result<AwaitAnyOutcome> {
        self.apply_wake_grace(ctx, &event).await?;

        let tasks = self.load_all(task_ids).await?;

        // When the wake is itself some awaited task's terminal output,
        // return that task and leave its event unread.
        if let Some(task) = tasks
            .iter()
            .find(|t| t.status.is_terminal() && is_own_terminal_output(t, &event))
        {
            return Ok(AwaitAnyOutcome::Terminal {
                task: task.clone(),
                pending: pending_ids(&tasks, &task.id),
            });
        }

        if let Some(task) = tasks.iter().find(|t| t.status.is_terminal()) {
            // A completion raced with a foreign wake; the completion wins
            // and the wake event is consumed.
            bus.ack(&event.stream, std::slice::from_ref(&event.id), reader)
                .await?;
            return Ok(AwaitAnyOutcome::Terminal {
                task: task.clone(),
                pending: pending_ids(&tasks, &task.id),
            });
        }

        bus.ack(&event.stream, std::slice::from_ref(&event.id), reader)
            .await?;
        let priority = event.priority();
        Ok(AwaitAnyOutcome::Woken {
            event,
            priority,
            pending: tasks.iter().map(|t| t.id.clone()).collect(),
        })
    }

    /// List-and-filter pass over the wake streams for unread wake events
    /// addressed to the targets. Listing never creates receipts, so a
    /// terminal event surfaced here can still be preserved unread; ignored
    /// events are acked and skipped.
    async fn drain_wake_events(
        &self,
        ctx: &CallContext,
        bus: &EventBus,
        targets: &BTreeSet<String>,
        reader: &str,
    ) -> Result<Option<Event>> {
        let mut candidates: Vec<Event> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for stream in streams::WAKE {
            let mut scopes = vec![("global".to_string(), "*".to_string())];
            for target in targets {
                scopes.push(("task".to_string(), target.clone()));
            }
            for (scope_type, scope_id) in scopes {
                let events = bus
                    .list(
                        stream,
                        &ListOptions {
                            scope_type,
                            scope_id,
                            reader: Some(reader.to_string()),
                            order: ListOrder::Fifo,
                            limit: None,
                        },
                    )
                    .await?;
                for event in events {
                    if seen.insert((event.stream.clone(), event.id.clone())) {
                        candidates.push(event);
                    }
                }
            }
        }

        candidates.sort_by(|a, b| {
            (a.created_at, &a.stream, &a.id).cmp(&(b.created_at, &b.stream, &b.id))
        });

        for event in candidates {
            if event.read || !event.priority().wakes() {
                continue;
            }
            if !event_matches_targets(&event, targets) {
                continue;
            }
            if ctx.ignored_wake_event_ids.contains(&event.id) {
                bus.ack(&event.stream, std::slice::from_ref(&event.id), reader)
                    .await?;
                continue;
            }
            return Ok(Some(event));
        }
        Ok(None)
    }

    /// Sleep out the remainder of the wake-grace window so that a
    /// near-simultaneous completion beats the wake. Cancellable.
    async fn apply_wake_grace(&self, ctx: &CallContext, event: &Event) -> Result<()> {
        let grace = self.options().wake_grace;
        let age = Utc::now()
            .signed_duration_since(event.created_at)
            .to_std()
            .unwrap_or_default();
        if age >= grace {
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(grace - age) => Ok(()),
        }
    }

    async fn load_all(&self, task_ids: &[String]) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            tasks.push(self.load(id).await?);
        }
        Ok(tasks)
    }
}

fn pending_ids(tasks: &[Task], done_id: &str) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| t.id != done_id && !t.status.is_terminal())
        .map(|t| t.id.clone())
        .collect()
}

fn first_terminal(tasks: &[Task]) -> Option<AwaitAnyOutcome> {
    tasks
        .iter()
        .find(|t| t.status.is_terminal())
        .map(|task| AwaitAnyOutcome::Terminal {
            task: task.clone(),
            pending: pending_ids(tasks, &task.id),
        })
}
