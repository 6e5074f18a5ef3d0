//! Builders for the pieces with more than a couple of knobs.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::manager::{ManagerOptions, TaskManager};
use crate::store::Store;
use crate::types::{JsonMap, TaskSpec};

/// Builder for a [`TaskManager`].
///
/// ```no_run
/// use std::sync::Arc;
/// use taskbus::builders::TaskManagerBuilder;
/// use taskbus::bus::EventBus;
/// use taskbus::store::MemoryStore;
///
/// # fn main() -> taskbus::error::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let bus = Arc::new(EventBus::new(store.clone()));
/// let manager = TaskManagerBuilder::new()
///     .store(store)
///     .bus(bus)
///     .wake_grace(std::time::Duration::from_millis(50))
///     .build()?;
/// # let _ = manager;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct TaskManagerBuilder {
    store: Option<Arc<dyn Store>>,
    bus: Option<Arc<EventBus>>,
    options: ManagerOptions,
}

impl TaskManagerBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self {
            store: None,
            bus: None,
            options: ManagerOptions::default(),
        }
    }

    /// Set the backing store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach an event bus.
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Deadline used when an await is called with a zero timeout.
    pub fn default_await_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.default_await_timeout = timeout;
        self
    }

    /// Await loop poll cadence.
    pub fn poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    /// Wake debounce window.
    pub fn wake_grace(mut self, grace: std::time::Duration) -> Self {
        self.options.wake_grace = grace;
        self
    }

    /// Default `list` limit.
    pub fn list_limit(mut self, limit: usize) -> Self {
        self.options.list_limit = limit;
        self
    }

    /// Build the manager; fails without a store.
    pub fn build(self) -> Result<TaskManager> {
        let store = self
            .store
            .ok_or_else(|| Error::validation("store is required"))?;
        Ok(TaskManager::from_parts(store, self.bus, self.options))
    }
}

/// Builder for a [`TaskSpec`], for callers assembling specs field by field.
#[derive(Debug, Default)]
pub struct TaskSpecBuilder {
    task_type: String,
    name: Option<String>,
    owner: Option<String>,
    metadata: JsonMap,
    payload: JsonMap,
}

impl TaskSpecBuilder {
    /// Start a spec of the given type.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    /// Id-prefix name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Owner principal.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Insert one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Insert one payload entry.
    pub fn payload_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Finish; fails on an empty type.
    pub fn build(self) -> Result<TaskSpec> {
        if self.task_type.is_empty() {
            return Err(Error::validation("task type is required"));
        }
        Ok(TaskSpec {
            task_type: self.task_type,
            name: self.name,
            owner: self.owner,
            metadata: self.metadata,
            payload: self.payload,
        })
    }
}
