//! Core types — tasks, updates, events, priorities, and stream names.
//!
//! Dynamic maps (`metadata`, `payload`, `result`) are part of the external
//! contract and stay schema-flexible: they are `serde_json::Map` values, not
//! statically typed structs. Everything else gets a concrete type.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::{ContextV7, Timestamp, Uuid};

/// Free-form JSON object used for metadata, payloads, and results.
pub type JsonMap = serde_json::Map<String, Value>;

// ============================================================================
// Identifiers
// ============================================================================

/// Shared v7 context so ids generated within one millisecond still sort in
/// generation order.
static ID_CONTEXT: LazyLock<Mutex<ContextV7>> = LazyLock::new(|| Mutex::new(ContextV7::new()));

/// Returns a new time-ordered id (UUID v7).
///
/// Ids are lexicographically sortable by creation time, which makes
/// `id > after_id` range queries over the update log a strict ordering.
pub fn ordered_id() -> String {
    let ctx = ID_CONTEXT.lock().unwrap();
    Uuid::new_v7(Timestamp::now(&*ctx)).to_string()
}

/// Builds a task id of the form `<prefix>-<uuidv7>`.
///
/// The prefix is the sanitized spec name (or type): lowercased, with runs of
/// non-alphanumeric characters collapsed to single dashes.
pub fn task_id(prefix: &str) -> String {
    let mut cleaned = String::with_capacity(prefix.len());
    let mut last_dash = true;
    for ch in prefix.chars() {
        if ch.is_ascii_alphanumeric() {
            cleaned.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            cleaned.push('-');
            last_dash = true;
        }
    }
    let cleaned = cleaned.trim_end_matches('-');
    if cleaned.is_empty() {
        ordered_id()
    } else {
        format!("{}-{}", cleaned, ordered_id())
    }
}

// ============================================================================
// Task lifecycle
// ============================================================================

/// The lifecycle state of a task.
///
/// Transitions follow a DAG: `queued → {running, completed, failed,
/// cancelled}` and `running → {completed, failed, cancelled}`. The three
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted and waiting for a worker to claim it.
    Queued,
    /// A worker has taken responsibility for the task.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before completion (cancel or kill).
    Cancelled,
}

impl TaskStatus {
    /// Stable string form, matching the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states absorb all further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task — the unit of work tracked by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, time-ordered identifier (`<prefix>-<uuidv7>`).
    pub id: String,

    /// Task type (`exec`, `agent`, `llm`, or user-defined).
    #[serde(rename = "type")]
    pub task_type: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Logical principal that reads this task's completion events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Free-form metadata. Recognized keys: `parent_id`, `mode`,
    /// `notify_target`, `input_target`, `agent_id`, `tool_call_id`,
    /// `tool_name`.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,

    /// Free-form description of the work unit.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub payload: JsonMap,

    /// Result map, set on the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonMap>,

    /// Error string extracted from `result.error` or `result.reason`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation time (UTC, sub-second precision).
    pub created_at: DateTime<Utc>,

    /// Last modification time; monotonically non-decreasing.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// String-valued metadata lookup, `None` when absent or not a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Parent task id, when this task was spawned under another.
    pub fn parent_id(&self) -> Option<&str> {
        self.meta_str("parent_id")
    }

    /// Scope id for input command events. Falls back to the task's own id —
    /// commands are addressed to the task itself unless redirected.
    pub fn input_target(&self) -> &str {
        self.meta_str("input_target").unwrap_or(&self.id)
    }

    /// Scope id for output events. Falls back to the owner, then the task id.
    pub fn notify_target(&self) -> &str {
        self.meta_str("notify_target")
            .or(self.owner.as_deref())
            .unwrap_or(&self.id)
    }

    /// The scope ids whose wake events release an await on this task:
    /// `{owner, metadata.notify_target}`, empty entries elided.
    pub fn await_targets(&self) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        if let Some(owner) = self.owner.as_deref() {
            if !owner.is_empty() {
                targets.insert(owner.to_string());
            }
        }
        if let Some(notify) = self.meta_str("notify_target") {
            if !notify.is_empty() {
                targets.insert(notify.to_string());
            }
        }
        targets
    }
}

/// Specification for spawning a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Required task type.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Optional human-readable name; used as the id prefix when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Owner principal for completion events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Initial metadata.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,

    /// Work unit description.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub payload: JsonMap,
}

impl TaskSpec {
    /// Create a spec with the given type.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    /// Set the id-prefix name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the owner principal.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Insert one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the payload map.
    pub fn with_payload(mut self, payload: JsonMap) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================================================
// Task updates
// ============================================================================

/// Well-known update kinds. The kind space is open — workers may record
/// their own — but lifecycle transitions always use these.
pub mod kinds {
    /// Task row inserted.
    pub const SPAWN: &str = "spawn";
    /// Conditional `queued → running` succeeded.
    pub const STARTED: &str = "started";
    /// Input delivered to the task.
    pub const INPUT: &str = "input";
    /// Worker progress report.
    pub const PROGRESS: &str = "progress";
    /// An awaiter gave up at its deadline.
    pub const AWAIT_TIMEOUT: &str = "await_timeout";
    /// Terminal: completed successfully.
    pub const COMPLETED: &str = "completed";
    /// Terminal: failed.
    pub const FAILED: &str = "failed";
    /// Terminal: cancelled.
    pub const CANCELLED: &str = "cancelled";
    /// Terminal: cancelled by kill.
    pub const KILLED: &str = "killed";

    /// Kinds recorded by terminal transitions; their `task_output` events
    /// default to wake priority.
    pub fn is_terminal(kind: &str) -> bool {
        matches!(kind, COMPLETED | FAILED | CANCELLED | KILLED)
    }
}

/// One row of a task's append-only update log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Time-ordered unique id; `id > after_id` range queries give strict
    /// insertion order.
    pub id: String,

    /// The task this update belongs to.
    pub task_id: String,

    /// Update kind (see [`kinds`]).
    pub kind: String,

    /// Free-form update payload.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub payload: JsonMap,

    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Events
// ============================================================================

/// Fixed stream names used by the manager, plus the wake set.
pub mod streams {
    /// Commands and input addressed to a task.
    pub const TASK_INPUT: &str = "task_input";
    /// Task progress and terminal output.
    pub const TASK_OUTPUT: &str = "task_output";
    /// Lifecycle command signals (cancel, kill).
    pub const SIGNALS: &str = "signals";
    /// Error reports.
    pub const ERRORS: &str = "errors";
    /// Events originating outside the runtime.
    pub const EXTERNAL: &str = "external";
    /// Inter-agent messages.
    pub const MESSAGES: &str = "messages";

    /// Streams an awaiter subscribes to. `task_input` is deliberately
    /// excluded: delivering input must not wake the sender's own await.
    pub const WAKE: [&str; 5] = [SIGNALS, ERRORS, EXTERNAL, MESSAGES, TASK_OUTPUT];
}

/// Event priority carried in `metadata.priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational; never breaks an await.
    #[default]
    Normal,
    /// Releases an outstanding await.
    Wake,
    /// Releases an outstanding await; reserved for urgent signals.
    Interrupt,
}

impl Priority {
    /// Parse the metadata string form; unknown or empty means `Normal`.
    pub fn parse(s: &str) -> Priority {
        match s {
            "wake" => Priority::Wake,
            "interrupt" => Priority::Interrupt,
            _ => Priority::Normal,
        }
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Wake => "wake",
            Priority::Interrupt => "interrupt",
        }
    }

    /// Whether this priority releases an awaiter.
    pub fn wakes(&self) -> bool {
        matches!(self, Priority::Wake | Priority::Interrupt)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted event on one stream, addressed to one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Time-ordered unique id.
    pub id: String,

    /// Stream (channel) name.
    pub stream: String,

    /// Scope type (`"task"`, `"global"`, or empty for broadcast).
    #[serde(default)]
    pub scope_type: String,

    /// Scope id within the scope type; empty for broadcast.
    #[serde(default)]
    pub scope_id: String,

    /// Short subject line.
    #[serde(default)]
    pub subject: String,

    /// Human-readable body.
    #[serde(default)]
    pub body: String,

    /// Free-form metadata; `priority`, `action`, `task_id`, and `kind` are
    /// recognized by the manager.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,

    /// Free-form payload.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub payload: JsonMap,

    /// Id of the entity that produced the event (task id for task output).
    #[serde(default)]
    pub source_id: String,

    /// Persist time.
    pub created_at: DateTime<Utc>,

    /// Per-reader view state: whether the requesting reader already holds a
    /// read-receipt. Not persisted on the event row itself.
    #[serde(default)]
    pub read: bool,
}

impl Event {
    /// Priority classified from `metadata.priority`; absent means normal.
    pub fn priority(&self) -> Priority {
        self.metadata
            .get("priority")
            .and_then(Value::as_str)
            .map(Priority::parse)
            .unwrap_or_default()
    }

    /// The update kind carried in `metadata.kind`, for task output events.
    pub fn update_kind(&self) -> Option<&str> {
        self.metadata.get("kind").and_then(Value::as_str)
    }

    /// String-valued metadata lookup.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Input for [`EventBus::push`](crate::bus::EventBus::push). The bus assigns
/// the id and timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventInput {
    /// Target stream; required.
    pub stream: String,

    /// Scope type; empty means broadcast (matches every scope query).
    #[serde(default)]
    pub scope_type: String,

    /// Scope id; empty means broadcast.
    #[serde(default)]
    pub scope_id: String,

    /// Short subject line.
    #[serde(default)]
    pub subject: String,

    /// Human-readable body.
    #[serde(default)]
    pub body: String,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,

    /// Free-form payload.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub payload: JsonMap,

    /// Producer id.
    #[serde(default)]
    pub source_id: String,
}

impl EventInput {
    /// Create an input for the given stream.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            ..Default::default()
        }
    }

    /// Address the event to a scope.
    pub fn scoped(mut self, scope_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        self.scope_type = scope_type.into();
        self.scope_id = scope_id.into();
        self
    }

    /// Set the subject line.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the body text.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set `metadata.priority`.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.metadata
            .insert("priority".into(), Value::String(priority.as_str().into()));
        self
    }

    /// Insert one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the payload map.
    pub fn payload(mut self, payload: JsonMap) -> Self {
        self.payload = payload;
        self
    }

    /// Set the producer id.
    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Ordering for event listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Oldest first.
    Fifo,
    /// Newest first (the default).
    #[default]
    Lifo,
}

/// Scope query matching, shared by every store implementation and the bus's
/// subscription filter.
///
/// Rules:
/// - a query of `("global", "*")` or `("", "*")` matches any event;
/// - events with an empty scope are broadcast and match any query;
/// - a `"*"` scope id with a concrete type matches any event of that type;
/// - otherwise the scope must match exactly.
pub fn scope_query_matches(query_type: &str, query_id: &str, event: &Event) -> bool {
    if query_id == "*" && (query_type.is_empty() || query_type == "global") {
        return true;
    }
    if event.scope_type.is_empty() && event.scope_id.is_empty() {
        return true;
    }
    if query_id == "*" {
        return event.scope_type == query_type;
    }
    event.scope_type == query_type && event.scope_id == query_id
}
