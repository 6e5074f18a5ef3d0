//! Durable store backed by SQLite (rusqlite, bundled).
//!
//! A single connection behind an async mutex — one writer, WAL journal.
//! Writes hitting `SQLITE_BUSY`/`SQLITE_LOCKED` (another process on the same
//! file) are retried with linear backoff, 25·n ms for five attempts, then
//! surfaced as [`Error::StoreBusy`]. Reads never retry; a stale row must be
//! visible to the caller, not silently re-fetched.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{
    scope_query_matches, Event, JsonMap, ListOrder, Task, TaskStatus, TaskUpdate,
};

use super::{EventFilter, StatusChange, Store, TaskFilter, UpdateFilter};

const WRITE_RETRY_ATTEMPTS: u32 = 5;
const WRITE_RETRY_BASE_MS: u64 = 25;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id         TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    status     TEXT NOT NULL,
    owner      TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata   TEXT NOT NULL DEFAULT '{}',
    payload    TEXT NOT NULL DEFAULT '{}',
    result     TEXT,
    error      TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_type ON tasks (status, type, created_at);

CREATE TABLE IF NOT EXISTS task_updates (
    id         TEXT PRIMARY KEY,
    task_id    TEXT NOT NULL,
    kind       TEXT NOT NULL,
    payload    TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_updates_task ON task_updates (task_id, id);

CREATE TABLE IF NOT EXISTS events (
    id         TEXT PRIMARY KEY,
    stream     TEXT NOT NULL,
    scope_type TEXT NOT NULL DEFAULT '',
    scope_id   TEXT NOT NULL DEFAULT '',
    subject    TEXT NOT NULL DEFAULT '',
    body       TEXT NOT NULL DEFAULT '',
    metadata   TEXT NOT NULL DEFAULT '{}',
    payload    TEXT NOT NULL DEFAULT '{}',
    source_id  TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_stream ON events (stream, created_at, id);

CREATE TABLE IF NOT EXISTS event_reads (
    event_id  TEXT NOT NULL,
    reader_id TEXT NOT NULL,
    read_at   TEXT NOT NULL,
    PRIMARY KEY (event_id, reader_id)
);
";

/// Durable [`Store`] implementation on SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::store(format!("open database: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::store(format!("set journal mode: {e}")))?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database. Each call gets independent state.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::store(format!("open in-memory database: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::store(format!("create tables: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a write with bounded busy retry.
    async fn write<T>(
        &self,
        context: &str,
        op: impl Fn(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            let outcome = {
                let mut conn = self.conn.lock().await;
                op(&mut conn)
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    if attempt == WRITE_RETRY_ATTEMPTS {
                        debug!(context, attempts = attempt, "write retries exhausted");
                        return Err(Error::StoreBusy);
                    }
                    tokio::time::sleep(Duration::from_millis(
                        WRITE_RETRY_BASE_MS * u64::from(attempt),
                    ))
                    .await;
                }
                Err(err) => return Err(Error::store(format!("{context}: {err}"))),
            }
        }
        Err(Error::StoreBusy)
    }

    /// Run a read. No retry: stale observations are the caller's concern.
    async fn read<T>(
        &self,
        context: &str,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().await;
        op(&conn).map_err(|e| Error::store(format!("{context}: {e}")))
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    // Fixed-width nanosecond RFC 3339 keeps lexicographic order chronological.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_from_sql(idx: usize, raw: &str) -> rusqlite::Result<JsonMap> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_to_sql(map: &JsonMap) -> Result<String> {
    serde_json::to_string(map).map_err(|e| Error::store(format!("encode payload: {e}")))
}

fn status_from_sql(idx: usize, raw: &str) -> rusqlite::Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown status {raw:?}").into(),
        )
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let payload: String = row.get(7)?;
    let result: Option<String> = row.get(8)?;
    Ok(Task {
        id: row.get(0)?,
        task_type: row.get(1)?,
        status: status_from_sql(2, &status)?,
        owner: row.get(3)?,
        created_at: ts_from_sql(4, &created_at)?,
        updated_at: ts_from_sql(5, &updated_at)?,
        metadata: json_from_sql(6, &metadata)?,
        payload: json_from_sql(7, &payload)?,
        result: match result {
            Some(raw) => Some(json_from_sql(8, &raw)?),
            None => None,
        },
        error: row.get(9)?,
    })
}

fn update_from_row(row: &Row<'_>) -> rusqlite::Result<TaskUpdate> {
    let payload: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(TaskUpdate {
        id: row.get(0)?,
        task_id: row.get(1)?,
        kind: row.get(2)?,
        payload: json_from_sql(3, &payload)?,
        created_at: ts_from_sql(4, &created_at)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let metadata: String = row.get(6)?;
    let payload: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    Ok(Event {
        id: row.get(0)?,
        stream: row.get(1)?,
        scope_type: row.get(2)?,
        scope_id: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        metadata: json_from_sql(6, &metadata)?,
        payload: json_from_sql(7, &payload)?,
        source_id: row.get(8)?,
        created_at: ts_from_sql(9, &created_at)?,
        read: false,
    })
}

const EVENT_COLUMNS: &str =
    "id, stream, scope_type, scope_id, subject, body, metadata, payload, source_id, created_at";
const TASK_COLUMNS: &str =
    "id, type, status, owner, created_at, updated_at, metadata, payload, result, error";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let metadata = json_to_sql(&task.metadata)?;
        let payload = json_to_sql(&task.payload)?;
        let result = task.result.as_ref().map(json_to_sql).transpose()?;
        let task = task.clone();
        self.write("insert task", move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, type, status, owner, created_at, updated_at, metadata, payload, result, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.id,
                    task.task_type,
                    task.status.as_str(),
                    task.owner,
                    ts_to_sql(task.created_at),
                    ts_to_sql(task.updated_at),
                    metadata,
                    payload,
                    result,
                    task.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let task_id = task_id.to_string();
        self.read("load task", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![task_id], task_from_row)?;
            rows.next().transpose()
        })
        .await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(ref task_type) = filter.task_type {
            args.push(task_type.clone());
            sql.push_str(&format!(" AND type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(ref owner) = filter.owner {
            args.push(owner.clone());
            sql.push_str(&format!(" AND owner = ?{}", args.len()));
        }
        if let Some(ref parent_id) = filter.parent_id {
            args.push(parent_id.clone());
            sql.push_str(&format!(
                " AND json_extract(metadata, '$.parent_id') = ?{}",
                args.len()
            ));
        }
        sql.push_str(if filter.oldest_first {
            " ORDER BY created_at ASC, id ASC"
        } else {
            " ORDER BY created_at DESC, id DESC"
        });
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.read("list tasks", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), task_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn update_task_status(&self, change: &StatusChange) -> Result<bool> {
        let result = change.result.as_ref().map(json_to_sql).transpose()?;
        let change = change.clone();
        self.write("update task status", move |conn| {
            let affected = conn.execute(
                "UPDATE tasks
                 SET status = ?1,
                     result = COALESCE(?2, result),
                     error = COALESCE(?3, error),
                     updated_at = MAX(updated_at, ?4)
                 WHERE id = ?5 AND status = ?6",
                params![
                    change.next.as_str(),
                    result,
                    change.error,
                    ts_to_sql(change.updated_at),
                    change.task_id,
                    change.expected.as_str(),
                ],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn touch_task(&self, task_id: &str, updated_at: DateTime<Utc>) -> Result<()> {
        let task_id = task_id.to_string();
        self.write("touch task", move |conn| {
            conn.execute(
                "UPDATE tasks SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
                params![ts_to_sql(updated_at), task_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_update(&self, update: &TaskUpdate) -> Result<()> {
        let payload = json_to_sql(&update.payload)?;
        let update = update.clone();
        self.write("insert update", move |conn| {
            conn.execute(
                "INSERT INTO task_updates (id, task_id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    update.id,
                    update.task_id,
                    update.kind,
                    payload,
                    ts_to_sql(update.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_updates(&self, filter: &UpdateFilter) -> Result<Vec<TaskUpdate>> {
        let filter = filter.clone();
        self.read("list updates", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, kind, payload, created_at FROM task_updates
                 WHERE task_id = ?1 AND id > ?2 AND (?3 IS NULL OR kind = ?3)
                 ORDER BY id ASC
                 LIMIT ?4",
            )?;
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
            let rows = stmt.query_map(
                params![
                    filter.task_id,
                    filter.after_id.clone().unwrap_or_default(),
                    filter.kind,
                    limit,
                ],
                update_from_row,
            )?;
            rows.collect()
        })
        .await
    }

    async fn insert_event(&self, event: &Event) -> Result<()> {
        let metadata = json_to_sql(&event.metadata)?;
        let payload = json_to_sql(&event.payload)?;
        let event = event.clone();
        self.write("insert event", move |conn| {
            conn.execute(
                "INSERT INTO events (id, stream, scope_type, scope_id, subject, body, metadata, payload, source_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.id,
                    event.stream,
                    event.scope_type,
                    event.scope_id,
                    event.subject,
                    event.body,
                    metadata,
                    payload,
                    event.source_id,
                    ts_to_sql(event.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_events(&self, stream: &str, ids: &[String]) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let stream = stream.to_string();
        let ids = ids.to_vec();
        self.read("load events", move |conn| {
            let placeholders = (2..ids.len() + 2)
                .map(|n| format!("?{n}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE stream = ?1 AND id IN ({placeholders})
                 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let args = std::iter::once(stream.clone()).chain(ids.iter().cloned());
            let rows = stmt.query_map(rusqlite::params_from_iter(args), event_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let stream = filter.stream.clone();
        let mut events: Vec<Event> = self
            .read("list events", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE stream = ?1
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(params![stream], event_from_row)?;
                rows.collect()
            })
            .await?;

        if let Some((scope_type, scope_id)) = &filter.scope {
            events.retain(|e| scope_query_matches(scope_type, scope_id, e));
        }
        if filter.order == ListOrder::Lifo {
            events.reverse();
        }
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn read_receipts(&self, ids: &[String], reader: &str) -> Result<HashSet<String>> {
        if ids.is_empty() || reader.is_empty() {
            return Ok(HashSet::new());
        }
        let ids = ids.to_vec();
        let reader = reader.to_string();
        self.read("load receipts", move |conn| {
            let placeholders = (2..ids.len() + 2)
                .map(|n| format!("?{n}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT event_id FROM event_reads
                 WHERE reader_id = ?1 AND event_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let args = std::iter::once(reader.clone()).chain(ids.iter().cloned());
            let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn claim_receipts(
        &self,
        ids: &[String],
        reader: &str,
        read_at: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        if ids.is_empty() || reader.is_empty() {
            return Ok(HashSet::new());
        }
        let ids = ids.to_vec();
        let reader = reader.to_string();
        self.write("claim receipts", move |conn| {
            let tx = conn.transaction()?;
            let existing: HashSet<String> = {
                let placeholders = (2..ids.len() + 2)
                    .map(|n| format!("?{n}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT event_id FROM event_reads
                     WHERE reader_id = ?1 AND event_id IN ({placeholders})"
                );
                let mut stmt = tx.prepare(&sql)?;
                let args = std::iter::once(reader.clone()).chain(ids.iter().cloned());
                let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            for id in &ids {
                if !existing.contains(id) {
                    tx.execute(
                        "INSERT OR IGNORE INTO event_reads (event_id, reader_id, read_at)
                         VALUES (?1, ?2, ?3)",
                        params![id, reader, ts_to_sql(read_at)],
                    )?;
                }
            }
            tx.commit()?;
            Ok(existing)
        })
        .await
    }
}
