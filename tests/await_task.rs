//! Await coordination: timeouts, wake events, suppression, and
//! terminal-event preservation.

mod common;

use std::time::Duration;

use common::{ctx, manager_with_bus, obj, spawn_exec, wait_until};
use serde_json::json;
use taskbus::bus::ListOptions;
use taskbus::error::Error;
use taskbus::manager::AwaitOutcome;
use taskbus::types::{kinds, streams, EventInput, Priority, TaskStatus};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn await_times_out_and_records_update() {
    let (manager, _bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;

    let outcome = manager
        .await_task(&ctx(), &task.id, Duration::from_millis(80))
        .await
        .unwrap();
    match &outcome {
        AwaitOutcome::TimedOut(pending) => assert_eq!(pending.status, TaskStatus::Queued),
        other => panic!("expected timeout, got {other:?}"),
    }

    let updates = manager.list_updates(&ctx(), &task.id, None).await.unwrap();
    assert!(
        updates.iter().any(|u| u.kind == kinds::AWAIT_TIMEOUT),
        "timeout must be observable in the update log"
    );

    // A later await on the finished task succeeds.
    manager
        .complete(&ctx(), &task.id, obj(json!({ "ok": true })))
        .await
        .unwrap();
    let outcome = manager
        .await_task(&ctx(), &task.id, Duration::from_millis(500))
        .await
        .unwrap();
    match outcome {
        AwaitOutcome::Terminal(done) => assert_eq!(done.status, TaskStatus::Completed),
        other => panic!("expected terminal, got {other:?}"),
    }
}

#[tokio::test]
async fn wake_event_releases_await_and_is_acked() {
    let (manager, bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;

    let awaiter = {
        let manager = manager.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            manager
                .await_task(&ctx(), &id, Duration::from_secs(2))
                .await
        })
    };
    assert!(
        wait_until(|| bus.subscriber_count() == 1, Duration::from_secs(1)).await,
        "awaiter should hold exactly one subscription"
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let pushed = bus
        .push(EventInput::new(streams::SIGNALS).priority(Priority::Wake))
        .await
        .unwrap();

    let outcome = awaiter.await.unwrap().unwrap();
    match outcome {
        AwaitOutcome::Woken {
            task: pending,
            event,
            priority,
        } => {
            assert_eq!(event.id, pushed.id);
            assert_eq!(priority, Priority::Wake);
            assert_eq!(pending.status, TaskStatus::Queued);
        }
        other => panic!("expected wake, got {other:?}"),
    }

    // The ownerless task derives reader "runtime"; the consumed event is
    // receipted for it.
    let listed = bus
        .list(
            streams::SIGNALS,
            &ListOptions {
                reader: Some("runtime".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(listed.iter().find(|e| e.id == pushed.id).unwrap().read);
}

#[tokio::test]
async fn pre_existing_wake_event_is_drained() {
    let (manager, bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;

    // Pushed before the await even starts; the drain pass must find it.
    let pushed = bus
        .push(EventInput::new(streams::EXTERNAL).priority(Priority::Interrupt))
        .await
        .unwrap();

    let outcome = manager
        .await_task(&ctx(), &task.id, Duration::from_secs(2))
        .await
        .unwrap();
    match outcome {
        AwaitOutcome::Woken { event, priority, .. } => {
            assert_eq!(event.id, pushed.id);
            assert_eq!(priority, Priority::Interrupt);
        }
        other => panic!("expected wake, got {other:?}"),
    }
}

#[tokio::test]
async fn ignored_wake_event_is_acked_and_skipped() {
    let (manager, bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;

    let pushed = bus
        .push(EventInput::new(streams::SIGNALS).priority(Priority::Wake))
        .await
        .unwrap();

    let ignoring = ctx().ignore_wake_event(pushed.id.clone());
    let outcome = manager
        .await_task(&ignoring, &task.id, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(outcome.timed_out(), "ignored wake must not release the await");

    let listed = bus
        .list(
            streams::SIGNALS,
            &ListOptions {
                reader: Some("runtime".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(
        listed.iter().find(|e| e.id == pushed.id).unwrap().read,
        "ignored wake events are acked so they cannot re-fire"
    );
}

#[tokio::test]
async fn own_terminal_event_stays_unread() {
    let (manager, bus) = manager_with_bus();
    let task = spawn_exec(&manager, Some("agent-a")).await;

    let awaiter = {
        let manager = manager.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            manager
                .await_task(&ctx(), &id, Duration::from_secs(2))
                .await
        })
    };
    assert!(wait_until(|| bus.subscriber_count() == 1, Duration::from_secs(1)).await);

    manager
        .complete(&ctx(), &task.id, obj(json!({ "ok": true })))
        .await
        .unwrap();

    let outcome = awaiter.await.unwrap().unwrap();
    match outcome {
        AwaitOutcome::Terminal(done) => assert_eq!(done.status, TaskStatus::Completed),
        other => panic!("expected terminal, got {other:?}"),
    }

    // The completion event is preserved for context reconstruction.
    let outputs = bus
        .list(
            streams::TASK_OUTPUT,
            &ListOptions {
                reader: Some("agent-a".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let terminal = outputs
        .iter()
        .find(|e| e.meta_str("kind") == Some(kinds::COMPLETED))
        .expect("terminal event exists");
    assert!(!terminal.read, "terminal event must stay unread");
}

#[tokio::test]
async fn foreign_scope_does_not_wake() {
    let (manager, bus) = manager_with_bus();
    let task = spawn_exec(&manager, Some("agent-a")).await;

    let awaiter = {
        let manager = manager.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            manager
                .await_task(&ctx(), &id, Duration::from_secs(2))
                .await
        })
    };
    assert!(wait_until(|| bus.subscriber_count() == 1, Duration::from_secs(1)).await);

    // Addressed to somebody else entirely.
    bus.push(
        EventInput::new(streams::MESSAGES)
            .scoped("task", "agent-b")
            .priority(Priority::Wake),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    manager
        .complete(&ctx(), &task.id, obj(json!({ "ok": true })))
        .await
        .unwrap();

    let outcome = awaiter.await.unwrap().unwrap();
    match outcome {
        AwaitOutcome::Terminal(done) => assert_eq!(done.status, TaskStatus::Completed),
        other => panic!("foreign-scope wake leaked through: {other:?}"),
    }
}

#[tokio::test]
async fn completion_within_grace_window_is_observed() {
    let (manager, bus) = manager_with_bus();
    let task = spawn_exec(&manager, Some("agent-a")).await;

    let awaiter = {
        let manager = manager.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            manager
                .await_task(&ctx(), &id, Duration::from_secs(2))
                .await
        })
    };
    assert!(wait_until(|| bus.subscriber_count() == 1, Duration::from_secs(1)).await);

    // Foreign wake arrives, then the completion lands inside the 100ms
    // grace window; the returned task must already be terminal.
    bus.push(
        EventInput::new(streams::EXTERNAL)
            .scoped("task", "agent-a")
            .priority(Priority::Wake),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager
        .complete(&ctx(), &task.id, obj(json!({ "ok": true })))
        .await
        .unwrap();

    let outcome = awaiter.await.unwrap().unwrap();
    match outcome {
        // Either shape is acceptable: the completion beat the wake in the
        // grace window (wake consumed), or the poll saw the terminal task
        // first.
        AwaitOutcome::Woken { task: t, .. } => assert_eq!(t.status, TaskStatus::Completed),
        AwaitOutcome::Terminal(t) => assert_eq!(t.status, TaskStatus::Completed),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn await_without_bus_is_rejected() {
    let store = std::sync::Arc::new(taskbus::store::MemoryStore::new());
    let manager = taskbus::manager::TaskManager::new(store);
    let task = manager
        .spawn(&ctx(), taskbus::types::TaskSpec::new("exec"))
        .await
        .unwrap();
    let err = manager
        .await_task(&ctx(), &task.id, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BusUnavailable));
}

#[tokio::test]
async fn await_unknown_task_is_not_found() {
    let (manager, _bus) = manager_with_bus();
    let err = manager
        .await_task(&ctx(), "exec-missing", Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn cancelled_context_aborts_await() {
    let (manager, _bus) = manager_with_bus();
    let task = spawn_exec(&manager, None).await;

    let token = CancellationToken::new();
    let cancellable = ctx().with_cancellation(token.clone());

    let awaiter = {
        let manager = manager.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            manager
                .await_task(&cancellable, &id, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();

    let err = awaiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}
