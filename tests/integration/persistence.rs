//! Snapshot durability: every transition leaves a loadable snapshot, and
//! a mid-run dump reloads into an equivalent schedulable state.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};

use foreman::core::task::{TaskId, TaskStatus};
use foreman::orchestration::{Scheduler, TaskRunner, WorkerPool};
use foreman::state::{FailureDisposition, RunState, StateStore};

use crate::fixtures::{task, FakeRunner};

#[tokio::test]
async fn test_mid_run_snapshot_reloads_into_equivalent_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run_state.json");
    let store = StateStore::open(
        RunState::new(
            "migrate the database",
            2,
            vec![task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])],
        ),
        path.clone(),
    )
    .unwrap();

    // Drive a few transitions by hand: a completes, b fails once.
    let id_a = TaskId::new("a");
    let id_b = TaskId::new("b");
    store.mark_running(&id_a).await.unwrap();
    store
        .complete_task(&id_a, vec!["schema.sql".to_string()], None, String::new())
        .await
        .unwrap();
    store.mark_running(&id_b).await.unwrap();
    store
        .resolve_failure(
            &id_b,
            foreman::core::task::FailureRecord {
                attempt: 1,
                timestamp: chrono::Utc::now(),
                reason: foreman::core::task::FailureReason::Crash,
                detail: "exit code 1".to_string(),
                output_tail: "stack trace".to_string(),
                artifacts: vec![],
            },
            FailureDisposition::Requeue,
        )
        .await
        .unwrap();

    // Reload and compare the schedulable surface.
    let reloaded = StateStore::load(&path).unwrap();
    let state = reloaded.current_state().await;

    assert_eq!(state.goal, "migrate the database");
    assert_eq!(state.iteration, 2);

    let a = reloaded.task(&id_a).await.unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.artifacts, vec!["schema.sql".to_string()]);

    let b = reloaded.task(&id_b).await.unwrap();
    assert_eq!(b.status, TaskStatus::Pending);
    assert_eq!(b.attempt_count, 1);
    assert_eq!(b.failure_history.len(), 1);
    assert_eq!(b.failure_history[0].output_tail, "stack trace");

    // Only b is ready (c still waits on b).
    let ready: Vec<String> = reloaded
        .ready_tasks()
        .await
        .iter()
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(ready, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_reloaded_store_is_schedulable_to_completion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run_state.json");
    let store = StateStore::open(
        RunState::new("goal", 1, vec![task("a", &[]), task("b", &["a"])]),
        path.clone(),
    )
    .unwrap();

    // Complete a, then abandon this store as if the process died.
    let id_a = TaskId::new("a");
    store.mark_running(&id_a).await.unwrap();
    store
        .complete_task(&id_a, vec![], None, String::new())
        .await
        .unwrap();
    drop(store);

    // Reload and let a fresh scheduler finish the remainder.
    let reloaded = Arc::new(StateStore::load(&path).unwrap());
    let runner = Arc::new(FakeRunner::new(Duration::from_millis(2)));
    let (worker_tx, mut worker_rx) = mpsc::channel(64);
    let pool = Arc::new(RwLock::new(WorkerPool::new(
        2,
        worker_tx,
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
    )));
    let (event_tx, _event_rx) = mpsc::channel(64);
    let mut scheduler = Scheduler::new(Arc::clone(&reloaded), pool, event_tx, 3, None);

    let summary = scheduler.run(&mut worker_rx).await.unwrap();

    assert_eq!(summary.completed, 2);
    assert!(reloaded.all_settled().await);

    // Only b ran on the resumed store; a's completion was durable.
    assert_eq!(runner.requests.lock().unwrap().len(), 1);
    assert_eq!(
        runner.requests.lock().unwrap()[0].task.id,
        TaskId::new("b")
    );
}

#[tokio::test]
async fn test_interrupted_running_task_requeues_on_resume() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run_state.json");
    let store = StateStore::open(
        RunState::new("goal", 1, vec![task("a", &[])]),
        path.clone(),
    )
    .unwrap();

    // The process dies while a is Running.
    store.mark_running(&TaskId::new("a")).await.unwrap();
    drop(store);

    let reloaded = StateStore::load(&path).unwrap();
    // Loaded verbatim first: the snapshot says Running.
    assert_eq!(
        reloaded.task(&TaskId::new("a")).await.unwrap().status,
        TaskStatus::Running
    );

    // The resume path requeues it so a fresh scheduler can pick it up.
    let requeued = reloaded.requeue_interrupted().await.unwrap();
    assert_eq!(requeued, vec![TaskId::new("a")]);
    assert_eq!(reloaded.ready_tasks().await.len(), 1);
}

#[tokio::test]
async fn test_snapshot_is_written_after_every_transition() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run_state.json");
    let store = StateStore::open(
        RunState::new("goal", 1, vec![task("a", &[])]),
        path.clone(),
    )
    .unwrap();

    let read_status = || {
        let contents = std::fs::read_to_string(&path).unwrap();
        let state: RunState = serde_json::from_str(&contents).unwrap();
        state.tasks[0].status.clone()
    };

    assert_eq!(read_status(), TaskStatus::Pending);

    store.mark_running(&TaskId::new("a")).await.unwrap();
    assert_eq!(read_status(), TaskStatus::Running);

    store
        .complete_task(&TaskId::new("a"), vec![], None, String::new())
        .await
        .unwrap();
    assert_eq!(read_status(), TaskStatus::Completed);
}
