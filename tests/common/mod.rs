//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskbus::builders::TaskManagerBuilder;
use taskbus::bus::EventBus;
use taskbus::context::CallContext;
use taskbus::manager::TaskManager;
use taskbus::store::MemoryStore;
use taskbus::types::{JsonMap, Task, TaskSpec};

/// Manager + bus over a fresh in-memory store, with short timing knobs so
/// wake and poll behavior is observable without slow tests.
pub fn manager_with_bus() -> (Arc<TaskManager>, Arc<EventBus>) {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(store.clone()));
    let manager = TaskManagerBuilder::new()
        .store(store)
        .bus(bus.clone())
        .poll_interval(Duration::from_millis(50))
        .wake_grace(Duration::from_millis(100))
        .build()
        .expect("manager builds");
    (Arc::new(manager), bus)
}

/// A context with no caller identity.
pub fn ctx() -> CallContext {
    CallContext::new()
}

/// Convert a `json!` object literal into the map type the APIs take.
pub fn obj(value: serde_json::Value) -> JsonMap {
    value.as_object().expect("object literal").clone()
}

/// Spawn an `exec` task, optionally owned.
pub async fn spawn_exec(manager: &TaskManager, owner: Option<&str>) -> Task {
    let mut spec = TaskSpec::new("exec");
    if let Some(owner) = owner {
        spec = spec
            .with_owner(owner)
            .with_meta("notify_target", owner);
    }
    manager.spawn(&ctx(), spec).await.expect("spawn")
}

/// Spawn a task with an explicit parent link.
pub async fn spawn_child(manager: &TaskManager, task_type: &str, parent_id: &str) -> Task {
    manager
        .spawn(
            &ctx(),
            TaskSpec::new(task_type).with_meta("parent_id", parent_id),
        )
        .await
        .expect("spawn child")
}

/// Poll until the closure returns true or the budget runs out.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
