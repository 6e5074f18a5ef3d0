//! Cancel and kill recursion over the parent/child task graph.

mod common;

use common::{ctx, manager_with_bus, obj, spawn_child, spawn_exec};
use serde_json::json;
use taskbus::bus::ListOptions;
use taskbus::types::{kinds, streams, ListOrder, Priority, TaskStatus};

#[tokio::test]
async fn kill_cascades_to_children() {
    let (manager, _bus) = manager_with_bus();
    let parent = spawn_exec(&manager, None).await;
    let child = spawn_child(&manager, "exec", &parent.id).await;

    let killed = manager
        .kill(&ctx(), &parent.id, Some("shutdown"))
        .await
        .unwrap();
    assert_eq!(killed.status, TaskStatus::Cancelled);
    assert_eq!(killed.result.as_ref().unwrap()["killed"], true);
    assert_eq!(killed.error.as_deref(), Some("shutdown"));

    let child = manager.get(&ctx(), &child.id).await.unwrap();
    assert_eq!(child.status, TaskStatus::Cancelled);
    assert_eq!(child.result.as_ref().unwrap()["killed"], true);

    let updates = manager.list_updates(&ctx(), &child.id, None).await.unwrap();
    assert_eq!(updates.last().unwrap().kind, kinds::KILLED);
}

#[tokio::test]
async fn cancel_reaches_grandchildren() {
    let (manager, _bus) = manager_with_bus();
    let parent = spawn_exec(&manager, None).await;
    let child = spawn_child(&manager, "exec", &parent.id).await;
    let grandchild = spawn_child(&manager, "exec", &child.id).await;

    manager.cancel(&ctx(), &parent.id, None).await.unwrap();

    for id in [&parent.id, &child.id, &grandchild.id] {
        let task = manager.get(&ctx(), id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled, "task {id}");
        let updates = manager.list_updates(&ctx(), id, None).await.unwrap();
        assert_eq!(updates.last().unwrap().kind, kinds::CANCELLED);
    }
}

#[tokio::test]
async fn terminal_child_is_skipped_but_subtree_is_reached() {
    let (manager, _bus) = manager_with_bus();
    let parent = spawn_exec(&manager, None).await;
    let child = spawn_child(&manager, "exec", &parent.id).await;
    let grandchild = spawn_child(&manager, "exec", &child.id).await;

    manager
        .complete(&ctx(), &child.id, obj(json!({ "ok": true })))
        .await
        .unwrap();
    manager.cancel(&ctx(), &parent.id, None).await.unwrap();

    assert_eq!(
        manager.get(&ctx(), &child.id).await.unwrap().status,
        TaskStatus::Completed,
        "finished child keeps its result"
    );
    assert_eq!(
        manager.get(&ctx(), &grandchild.id).await.unwrap().status,
        TaskStatus::Cancelled,
        "live grandchild under a finished child is still cancelled"
    );
}

#[tokio::test]
async fn cancel_on_terminal_root_is_invalid() {
    let (manager, _bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;
    manager
        .complete(&ctx(), &task.id, obj(json!({ "ok": true })))
        .await
        .unwrap();

    let err = manager.cancel(&ctx(), &task.id, None).await.unwrap_err();
    assert!(err.is_invalid_transition());
}

#[tokio::test]
async fn cancel_is_idempotent_on_cancelled_root() {
    let (manager, _bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;
    manager.cancel(&ctx(), &task.id, Some("first")).await.unwrap();
    // Same-to-same: a second cancel is a no-op, not an error.
    let again = manager.cancel(&ctx(), &task.id, Some("second")).await.unwrap();
    assert_eq!(again.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_emits_interrupt_commands() {
    let (manager, bus) = manager_with_bus();
    let parent = spawn_exec(&manager, None).await;
    let child = spawn_child(&manager, "exec", &parent.id).await;

    manager.cancel(&ctx(), &parent.id, Some("stop")).await.unwrap();

    let signals = bus
        .list(
            streams::SIGNALS,
            &ListOptions {
                order: ListOrder::Fifo,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(signals.len(), 2, "one command per task in the tree");
    // Parent first (depth-first, pre-order).
    assert_eq!(signals[0].scope_id, parent.input_target());
    assert_eq!(signals[1].scope_id, child.input_target());
    for signal in &signals {
        assert_eq!(signal.meta_str("action"), Some("cancel"));
        assert_eq!(signal.meta_str("reason"), Some("stop"));
        assert_eq!(signal.priority(), Priority::Interrupt);
    }
}

#[tokio::test]
async fn parent_cycles_terminate() {
    use std::sync::Arc;
    use taskbus::manager::TaskManager;
    use taskbus::store::{MemoryStore, Store};
    use taskbus::types::{JsonMap, Task};

    // A parent cycle cannot be produced through spawn, so seed the store
    // with two tasks pointing at each other and check the visited set
    // breaks the recursion.
    let store = Arc::new(MemoryStore::new());
    let now = chrono::Utc::now();
    let make = |id: &str, parent: &str| {
        let mut metadata = JsonMap::new();
        metadata.insert(
            "parent_id".into(),
            serde_json::Value::String(parent.into()),
        );
        Task {
            id: id.into(),
            task_type: "exec".into(),
            status: TaskStatus::Queued,
            owner: None,
            metadata,
            payload: JsonMap::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    };
    store.insert_task(&make("loop-a", "loop-b")).await.unwrap();
    store.insert_task(&make("loop-b", "loop-a")).await.unwrap();

    let manager = TaskManager::new(store);
    manager.cancel(&ctx(), "loop-a", None).await.unwrap();

    for id in ["loop-a", "loop-b"] {
        assert_eq!(
            manager.get(&ctx(), id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }
}
