//! End-to-end lifecycle on the durable SQLite store, including reopening
//! the database file.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ctx, obj};
use serde_json::json;
use taskbus::builders::TaskManagerBuilder;
use taskbus::bus::{EventBus, ListOptions};
use taskbus::manager::{AwaitOutcome, TaskManager};
use taskbus::store::SqliteStore;
use taskbus::types::{kinds, streams, TaskSpec, TaskStatus};

fn sqlite_manager(store: Arc<SqliteStore>) -> (Arc<TaskManager>, Arc<EventBus>) {
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

#[tokio::test]
async fn full_lifecycle_on_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let (manager, bus) = sqlite_manager(store);

    let task = manager
        .spawn(
            &ctx(),
            TaskSpec::new("exec").with_owner("agent-a").with_meta("notify_target", "agent-a"),
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let claimed = manager.claim_queued(&ctx(), "exec", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, TaskStatus::Running);

    manager
        .complete(&ctx(), &task.id, obj(json!({ "ok": true })))
        .await
        .unwrap();

    match manager
        .await_task(&ctx(), &task.id, Duration::from_secs(1))
        .await
        .unwrap()
    {
        AwaitOutcome::Terminal(done) => {
            assert_eq!(done.status, TaskStatus::Completed);
            assert_eq!(done.result.unwrap()["ok"], true);
        }
        other => panic!("expected terminal, got {other:?}"),
    }

    let updates = manager.list_updates(&ctx(), &task.id, None).await.unwrap();
    let kinds_seen: Vec<&str> = updates.iter().map(|u| u.kind.as_str()).collect();
    assert_eq!(
        kinds_seen,
        vec![kinds::SPAWN, kinds::STARTED, kinds::COMPLETED]
    );

    let outputs = bus
        .list(streams::TASK_OUTPUT, &ListOptions::default())
        .await
        .unwrap();
    assert!(outputs.iter().any(|e| e.meta_str("kind") == Some(kinds::COMPLETED)));
}

#[tokio::test]
async fn state_survives_reopening_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskbus.db");

    let task_id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let (manager, _bus) = sqlite_manager(store);
        let task = manager.spawn(&ctx(), TaskSpec::new("exec")).await.unwrap();
        manager
            .fail(&ctx(), &task.id, "host rebooted")
            .await
            .unwrap();
        task.id
    };

    // Fresh handle over the same file sees the terminal state and the log.
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let (manager, bus) = sqlite_manager(store);

    let task = manager.get(&ctx(), &task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("host rebooted"));

    let updates = manager.list_updates(&ctx(), &task_id, None).await.unwrap();
    assert!(updates.iter().any(|u| u.kind == kinds::FAILED));

    let inputs = bus
        .list(streams::TASK_INPUT, &ListOptions::default())
        .await
        .unwrap();
    assert!(
        inputs.iter().any(|e| e.meta_str("action") == Some(kinds::SPAWN)),
        "spawn announcement survives reopen"
    );
}

#[tokio::test]
async fn receipts_persist_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskbus.db");

    let event_id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let bus = EventBus::new(store);
        let ev = bus
            .push(taskbus::types::EventInput::new(streams::EXTERNAL))
            .await
            .unwrap();
        bus.ack(streams::EXTERNAL, &[ev.id.clone()], "agent-a")
            .await
            .unwrap();
        ev.id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let bus = EventBus::new(store);
    let listed = bus
        .list(
            streams::EXTERNAL,
            &ListOptions {
                reader: Some("agent-a".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(listed.iter().find(|e| e.id == event_id).unwrap().read);
}
