//! Agent-side call surface — the thin adapter a tool-calling layer invokes.
//!
//! Methods take loosely typed JSON params (the wire shape tool calls arrive
//! in), validate required fields by hand, and return JSON payloads with the
//! stable field names callers depend on (`task_id`, `status`, `pending`,
//! `background`, `wake_event_id`, `wake_stream`, `await_error`, `result`,
//! `error`).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::manager::{AwaitOutcome, TaskManager};
use crate::types::{streams, EventInput, JsonMap, Priority, TaskSpec};

/// Tool adapter over a shared [`TaskManager`].
pub struct ToolSurface {
    manager: Arc<TaskManager>,
}

impl ToolSurface {
    /// Wrap a manager.
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }

    /// Spawn an `exec` task and optionally await it.
    ///
    /// Params: `code` (required), `wait_seconds` (required; `0` backgrounds
    /// immediately), `name` (optional id prefix). The caller's task id from
    /// the context becomes the owner and notify target.
    pub async fn exec(&self, ctx: &CallContext, params: Value) -> Result<Value> {
        let code = params
            .get("code")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::validation("missing 'code'"))?;
        let wait_seconds = params
            .get("wait_seconds")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::validation("missing 'wait_seconds'"))?;

        let mut spec = TaskSpec::new("exec");
        if let Some(name) = params.get("name").and_then(Value::as_str) {
            spec = spec.with_name(name);
        }
        if let Some(owner) = ctx.task_id.as_deref() {
            spec = spec.with_owner(owner).with_meta("notify_target", owner);
        }
        let mut payload = JsonMap::new();
        payload.insert("code".into(), Value::String(code.into()));
        spec = spec.with_payload(payload);

        let task = self.manager.spawn(ctx, spec).await?;
        debug!(task_id = %task.id, wait_seconds, "exec task spawned");

        if wait_seconds <= 0.0 {
            return Ok(json!({
                "task_id": task.id,
                "status": task.status,
                "pending": true,
                "background": true,
            }));
        }

        let outcome = self
            .manager
            .await_task(ctx, &task.id, Duration::from_secs_f64(wait_seconds))
            .await?;
        self.settle(ctx, outcome).await
    }

    /// Await an existing task.
    ///
    /// Params: `task_id`, `wait_seconds` (both required; `0` returns the
    /// current snapshot without waiting).
    pub async fn await_task(&self, ctx: &CallContext, params: Value) -> Result<Value> {
        let task_id = required_str(&params, "task_id")?;
        let wait_seconds = params
            .get("wait_seconds")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::validation("missing 'wait_seconds'"))?;

        if wait_seconds <= 0.0 {
            let task = self.manager.get(ctx, task_id).await?;
            if task.status.is_terminal() {
                return self.settle(ctx, AwaitOutcome::Terminal(task)).await;
            }
            return Ok(json!({
                "task_id": task.id,
                "status": task.status,
                "pending": true,
                "background": true,
            }));
        }

        let outcome = self
            .manager
            .await_task(ctx, task_id, Duration::from_secs_f64(wait_seconds))
            .await?;
        self.settle(ctx, outcome).await
    }

    /// Deliver text to a task. `agent` and `llm` tasks get a wake-priority
    /// `messages` event addressed to their input target; anything else goes
    /// through `manager.send` as `{text: body}` input.
    pub async fn send_task(&self, ctx: &CallContext, params: Value) -> Result<Value> {
        let task_id = required_str(&params, "task_id")?;
        let body = required_str(&params, "body")?;

        let task = self.manager.get(ctx, task_id).await?;
        if matches!(task.task_type.as_str(), "agent" | "llm") {
            let bus = self.manager.bus().ok_or(Error::BusUnavailable)?;
            let event = bus
                .push(
                    EventInput::new(streams::MESSAGES)
                        .scoped("task", task.input_target())
                        .subject("message")
                        .body(body)
                        .priority(Priority::Wake)
                        .meta("task_id", task.id.as_str())
                        .source(ctx.task_id.clone().unwrap_or_default()),
                )
                .await?;
            return Ok(json!({
                "task_id": task.id,
                "delivered": true,
                "event_id": event.id,
            }));
        }

        let mut input = JsonMap::new();
        input.insert("text".into(), Value::String(body.into()));
        self.manager.send(ctx, task_id, input).await?;
        Ok(json!({ "task_id": task.id, "delivered": true }))
    }

    /// Cancel a task (and its descendants).
    pub async fn cancel_task(&self, ctx: &CallContext, params: Value) -> Result<Value> {
        let task_id = required_str(&params, "task_id")?;
        let reason = params.get("reason").and_then(Value::as_str);
        let task = self.manager.cancel(ctx, task_id, reason).await?;
        Ok(json!({ "task_id": task.id, "status": task.status }))
    }

    /// Kill a task (and its descendants); records `killed` updates.
    pub async fn kill_task(&self, ctx: &CallContext, params: Value) -> Result<Value> {
        let task_id = required_str(&params, "task_id")?;
        let reason = params.get("reason").and_then(Value::as_str);
        let task = self.manager.kill(ctx, task_id, reason).await?;
        Ok(json!({ "task_id": task.id, "status": task.status }))
    }

    /// Translate an await outcome into the stable response payload, acking
    /// delivered results so context refreshes do not replay them.
    async fn settle(&self, ctx: &CallContext, outcome: AwaitOutcome) -> Result<Value> {
        match outcome {
            AwaitOutcome::Terminal(task) => {
                let reader = task
                    .await_targets()
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "runtime".to_string());
                self.manager.ack_task_output(ctx, &task.id, &reader).await?;
                let mut out = json!({ "task_id": task.id, "status": task.status });
                if let Some(result) = task.result {
                    out["result"] = Value::Object(result);
                }
                if let Some(error) = task.error {
                    out["error"] = Value::String(error);
                }
                Ok(out)
            }
            AwaitOutcome::TimedOut(task) => Ok(json!({
                "task_id": task.id,
                "status": task.status,
                "pending": true,
                "background": true,
                "await_error": "await_timeout",
            })),
            AwaitOutcome::Woken { task, event, .. } => {
                if task.status.is_terminal() {
                    let reader = task
                        .await_targets()
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| "runtime".to_string());
                    self.manager.ack_task_output(ctx, &task.id, &reader).await?;
                }
                let mut out = json!({
                    "task_id": task.id,
                    "status": task.status,
                    "wake_event_id": event.id,
                    "wake_stream": event.stream,
                });
                if task.status.is_terminal() {
                    if let Some(result) = task.result {
                        out["result"] = Value::Object(result);
                    }
                    if let Some(error) = task.error {
                        out["error"] = Value::String(error);
                    }
                } else {
                    out["pending"] = Value::Bool(true);
                }
                Ok(out)
            }
        }
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation(format!("missing '{key}'")))
}
