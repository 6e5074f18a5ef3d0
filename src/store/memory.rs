//! In-memory store backed by a single `RwLock`.
//!
//! Suitable for tests and short-lived runtimes; all data is lost when the
//! process exits. One lock over the whole state keeps multi-row operations
//! (receipt claims, conditional updates) atomic without a transaction layer.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{scope_query_matches, Event, ListOrder, Task, TaskUpdate};

use super::{EventFilter, StatusChange, Store, TaskFilter, UpdateFilter};

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<String, Task>,
    /// Update log keyed by id; BTreeMap iteration gives ascending id order.
    updates: BTreeMap<String, TaskUpdate>,
    events: Vec<Event>,
    receipts: HashMap<(String, String), DateTime<Utc>>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn task_matches(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(ref task_type) = filter.task_type {
        if task.task_type != *task_type {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(ref owner) = filter.owner {
        if task.owner.as_deref() != Some(owner.as_str()) {
            return false;
        }
    }
    if let Some(ref parent_id) = filter.parent_id {
        if task.parent_id() != Some(parent_id.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::store(format!("insert task: duplicate id {}", task.id)));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        debug!(task_id = %task.id, "task inserted");
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| task_matches(t, filter))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        if !filter.oldest_first {
            tasks.reverse();
        }
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn update_task_status(&self, change: &StatusChange) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&change.task_id) else {
            return Ok(false);
        };
        if task.status != change.expected {
            return Ok(false);
        }
        task.status = change.next;
        if change.result.is_some() {
            task.result = change.result.clone();
        }
        if change.error.is_some() {
            task.error = change.error.clone();
        }
        task.updated_at = task.updated_at.max(change.updated_at);
        debug!(
            task_id = %change.task_id,
            from = %change.expected,
            to = %change.next,
            "status updated"
        );
        Ok(true)
    }

    async fn touch_task(&self, task_id: &str, updated_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.updated_at = task.updated_at.max(updated_at);
        }
        Ok(())
    }

    async fn insert_update(&self, update: &TaskUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.updates.insert(update.id.clone(), update.clone());
        Ok(())
    }

    async fn list_updates(&self, filter: &UpdateFilter) -> Result<Vec<TaskUpdate>> {
        let inner = self.inner.read().await;
        let after = filter.after_id.as_deref().unwrap_or("");
        let mut rows = Vec::new();
        for (id, update) in inner.updates.iter() {
            if update.task_id != filter.task_id || id.as_str() <= after {
                continue;
            }
            if let Some(ref kind) = filter.kind {
                if update.kind != *kind {
                    continue;
                }
            }
            rows.push(update.clone());
            if filter.limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
        }
        Ok(rows)
    }

    async fn insert_event(&self, event: &Event) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.events.push(event.clone());
        Ok(())
    }

    async fn get_events(&self, stream: &str, ids: &[String]) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.stream == stream && wanted.contains(e.id.as_str()))
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(events)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.stream == filter.stream)
            .filter(|e| match &filter.scope {
                Some((scope_type, scope_id)) => scope_query_matches(scope_type, scope_id, e),
                None => true,
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        if filter.order == ListOrder::Lifo {
            events.reverse();
        }
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn read_receipts(&self, ids: &[String], reader: &str) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter(|id| {
                inner
                    .receipts
                    .contains_key(&((*id).clone(), reader.to_string()))
            })
            .cloned()
            .collect())
    }

    async fn claim_receipts(
        &self,
        ids: &[String],
        reader: &str,
        read_at: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        let mut inner = self.inner.write().await;
        let mut existing = HashSet::new();
        for id in ids {
            let key = (id.clone(), reader.to_string());
            if inner.receipts.contains_key(&key) {
                existing.insert(id.clone());
            } else {
                inner.receipts.insert(key, read_at);
            }
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ordered_id, JsonMap, TaskStatus};

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            task_type: "exec".into(),
            status,
            owner: None,
            metadata: JsonMap::new(),
            payload: JsonMap::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = MemoryStore::new();
        store.insert_task(&task("t1", TaskStatus::Queued)).await.unwrap();
        assert!(store.insert_task(&task("t1", TaskStatus::Queued)).await.is_err());
    }

    #[tokio::test]
    async fn conditional_update_requires_expected_status() {
        let store = MemoryStore::new();
        store.insert_task(&task("t1", TaskStatus::Queued)).await.unwrap();

        let change = StatusChange {
            task_id: "t1".into(),
            expected: TaskStatus::Running,
            next: TaskStatus::Completed,
            result: None,
            error: None,
            updated_at: Utc::now(),
        };
        assert!(!store.update_task_status(&change).await.unwrap());

        let change = StatusChange {
            expected: TaskStatus::Queued,
            next: TaskStatus::Running,
            ..change
        };
        assert!(store.update_task_status(&change).await.unwrap());
        let stored = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn updated_at_never_regresses() {
        let store = MemoryStore::new();
        let t = task("t1", TaskStatus::Queued);
        let original = t.updated_at;
        store.insert_task(&t).await.unwrap();

        let past = original - chrono::Duration::seconds(30);
        store.touch_task("t1", past).await.unwrap();
        let stored = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.updated_at, original);
    }

    #[tokio::test]
    async fn claim_receipts_reports_pre_existing() {
        let store = MemoryStore::new();
        let ids = vec![ordered_id(), ordered_id()];
        let first = store
            .claim_receipts(&ids, "agent-a", Utc::now())
            .await
            .unwrap();
        assert!(first.is_empty());

        let second = store
            .claim_receipts(&ids, "agent-a", Utc::now())
            .await
            .unwrap();
        assert_eq!(second.len(), 2);

        // A different reader sees no receipts.
        let other = store.read_receipts(&ids, "agent-b").await.unwrap();
        assert!(other.is_empty());
    }
}
