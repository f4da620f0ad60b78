//! Supervision and recovery: reaper kills, resurrection context, retry
//! exhaustion, and thrashing detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use foreman::core::task::{FailureReason, Task, TaskId, TaskStatus};
use foreman::orchestration::{
    ExecutionReport, ExecutionRequest, ExecutionSummary, OutputTrace, Reaper, ReaperConfig,
    Scheduler, StallJudge, TaskRunner, ThrashingDetector, WorkerFailure, WorkerPool,
};
use foreman::state::{RunState, StateStore};

use crate::fixtures::{task, FakeOutcome, FakeRunner, NeverHungJudge};

fn fast_reaper_config() -> ReaperConfig {
    ReaperConfig {
        poll_interval: Duration::from_millis(10),
        startup_grace: Duration::from_millis(0),
        silence_timeout: Duration::from_millis(0),
        hard_silence: Duration::from_secs(3600),
        kill_grace: Duration::from_millis(10),
        loop_threshold: 30,
        loop_window: 50,
        heartbeat_marker: "[HEARTBEAT]".to_string(),
        expect_heartbeat: false,
    }
}

/// Run a graph to quiescence with a live reaper supervising the pool.
async fn run_supervised(
    tasks: Vec<Task>,
    max_parallel: usize,
    retry_limit: u32,
    timeout_override: Option<Duration>,
    runner: Arc<dyn TaskRunner>,
    judge: Arc<dyn StallJudge>,
) -> (ExecutionSummary, Arc<StateStore>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(
        StateStore::open(
            RunState::new("test goal", 1, tasks),
            dir.path().join("run_state.json"),
        )
        .expect("open store"),
    );
    let (worker_tx, mut worker_rx) = mpsc::channel(256);
    let pool = Arc::new(RwLock::new(WorkerPool::new(max_parallel, worker_tx, runner)));

    let reaper = Reaper::new(fast_reaper_config(), Arc::clone(&pool), judge);
    let reaper_cancel = CancellationToken::new();
    let reaper_task = tokio::spawn(reaper.run(reaper_cancel.clone()));

    let (event_tx, _event_rx) = mpsc::channel(256);
    let mut scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        event_tx,
        retry_limit,
        timeout_override,
    );
    let summary = scheduler.run(&mut worker_rx).await.expect("scheduler run");

    reaper_cancel.cancel();
    let _ = reaper_task.await;

    (summary, store, dir)
}

#[tokio::test]
async fn test_kill_threshold_overrun_is_terminated_and_contextualized() {
    // First attempt hangs past the 50ms kill threshold; the reaper
    // terminates it. The second attempt succeeds and must have seen the
    // prior failure in its resurrection package.
    let runner = Arc::new(FakeRunner::new(Duration::from_millis(1)).script(
        "a",
        vec![FakeOutcome::Hang, FakeOutcome::Succeed(vec!["out".to_string()])],
    ));

    let (summary, store, _dir) = run_supervised(
        vec![task("a", &[])],
        2,
        3,
        Some(Duration::from_millis(50)),
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        Arc::new(NeverHungJudge),
    )
    .await;

    assert_eq!(summary.completed, 1);

    let final_task = store.task(&TaskId::new("a")).await.unwrap();
    assert_eq!(final_task.status, TaskStatus::Completed);
    assert_eq!(final_task.attempt_count, 1);
    assert_eq!(final_task.failure_history[0].reason, FailureReason::Timeout);
    assert!(final_task.failure_history[0].detail.contains("kill threshold"));

    // The resurrected attempt carried the package.
    let attempts = runner.requests_for("a");
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].resurrection.is_none());
    let package = attempts[1].resurrection.as_ref().unwrap();
    assert_eq!(package.attempt, 2);
    assert_eq!(package.history[0].reason, FailureReason::Timeout);
    assert!(!package.hints.is_empty());
}

#[tokio::test]
async fn test_judged_stall_kill() {
    // No timeout pressure; the worker emits a little varied output and
    // then goes silent. Deterministic checks are inconclusive, so the
    // judgment call decides, and it says hung - once. The retry must not
    // be killed by the same verdict.
    struct HungOnceJudge {
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl StallJudge for HungOnceJudge {
        async fn judge(
            &self,
            _context: &foreman::orchestration::JudgeContext,
        ) -> foreman::Result<foreman::orchestration::StallVerdict> {
            if self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Ok(foreman::orchestration::StallVerdict::Active)
            } else {
                Ok(foreman::orchestration::StallVerdict::Hung {
                    reason: "no forward progress in recent output".to_string(),
                })
            }
        }
    }

    let runner = Arc::new(FakeRunner::new(Duration::from_millis(1)).script(
        "a",
        vec![FakeOutcome::Hang, FakeOutcome::Succeed(vec![])],
    ));

    let (summary, store, _dir) = run_supervised(
        vec![task("a", &[])],
        2,
        3,
        None,
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        Arc::new(HungOnceJudge {
            fired: std::sync::atomic::AtomicBool::new(false),
        }),
    )
    .await;

    assert_eq!(summary.completed, 1);
    let final_task = store.task(&TaskId::new("a")).await.unwrap();
    assert_eq!(
        final_task.failure_history[0].reason,
        FailureReason::JudgedStalled
    );
    assert!(final_task.failure_history[0].detail.contains("judged hung"));
}

#[tokio::test]
async fn test_retry_exhaustion_blocks_dependents_never_completes() {
    // Every attempt hangs; with a retry limit of 2 the task is killed
    // twice and then permanently failed. Its dependent must end Blocked.
    let runner = Arc::new(
        FakeRunner::new(Duration::from_millis(1)).script("a", vec![FakeOutcome::Hang]),
    );

    let (summary, store, _dir) = run_supervised(
        vec![task("a", &[]), task("b", &["a"])],
        2,
        2,
        Some(Duration::from_millis(40)),
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        Arc::new(NeverHungJudge),
    )
    .await;

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.blocked, 1);

    let a = store.task(&TaskId::new("a")).await.unwrap();
    assert!(matches!(a.status, TaskStatus::Failed { ref error } if error.contains("retry limit")));
    assert_eq!(a.attempt_count, 2);

    let b = store.task(&TaskId::new("b")).await.unwrap();
    assert!(
        matches!(b.status, TaskStatus::Blocked { ref reason } if reason.contains("dependency a failed"))
    );

    // The global kill counter saw both supervisor kills.
    let state = store.current_state().await;
    assert_eq!(state.total_kills, 2);
}

#[tokio::test]
async fn test_three_kills_produce_thrashing_signal_before_fourth_retry() {
    let runner = Arc::new(
        FakeRunner::new(Duration::from_millis(1)).script("a", vec![FakeOutcome::Hang]),
    );

    let (_summary, store, _dir) = run_supervised(
        vec![task("a", &[])],
        2,
        3,
        Some(Duration::from_millis(40)),
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        Arc::new(NeverHungJudge),
    )
    .await;

    // Exactly three attempts ran; the retry budget stopped the fourth.
    assert_eq!(runner.requests_for("a").len(), 3);

    // And the detector flags the pattern for the next planning request.
    let state = store.current_state().await;
    let signal = ThrashingDetector::default().evaluate(&state).unwrap();
    assert!(signal.implicated.contains(&TaskId::new("a")));
    assert!(signal.narrative.contains("not working"));
}

#[tokio::test]
async fn test_output_loop_is_killed_without_judge() {
    /// Worker that spews the same line, then hangs.
    struct LoopingRunner;

    #[async_trait]
    impl TaskRunner for LoopingRunner {
        async fn run(
            &self,
            request: ExecutionRequest,
            trace: Arc<OutputTrace>,
            cancel: CancellationToken,
        ) -> std::result::Result<ExecutionReport, WorkerFailure> {
            if request.task.attempt_count == 0 {
                for _ in 0..35 {
                    trace.push_line("Retrying connection to localhost:5432...");
                }
                cancel.cancelled().await;
                Err(WorkerFailure::Killed {
                    detail: "terminated by supervisor".to_string(),
                })
            } else {
                Ok(ExecutionReport {
                    artifacts: vec![],
                    actual_complexity: None,
                    notes: String::new(),
                })
            }
        }
    }

    let (summary, store, _dir) = run_supervised(
        vec![task("a", &[])],
        2,
        3,
        None,
        Arc::new(LoopingRunner),
        // A judge that would say Active: the loop check must kill first.
        Arc::new(NeverHungJudge),
    )
    .await;

    assert_eq!(summary.completed, 1);
    let final_task = store.task(&TaskId::new("a")).await.unwrap();
    assert_eq!(
        final_task.failure_history[0].reason,
        FailureReason::JudgedStalled
    );
    assert!(final_task.failure_history[0].detail.contains("output loop"));
    assert!(final_task.failure_history[0]
        .output_tail
        .contains("Retrying connection"));
}

#[tokio::test]
async fn test_killed_worker_diagnostic_is_preserved() {
    /// Worker that emits a distinctive final line when killed.
    struct DyingRunner;

    #[async_trait]
    impl TaskRunner for DyingRunner {
        async fn run(
            &self,
            request: ExecutionRequest,
            trace: Arc<OutputTrace>,
            cancel: CancellationToken,
        ) -> std::result::Result<ExecutionReport, WorkerFailure> {
            if request.task.attempt_count == 0 {
                trace.push_line("starting the migration");
                cancel.cancelled().await;
                trace.push_line("was about to write schema version 7");
                Err(WorkerFailure::Killed {
                    detail: "terminated by supervisor".to_string(),
                })
            } else {
                Ok(ExecutionReport {
                    artifacts: vec![],
                    actual_complexity: None,
                    notes: String::new(),
                })
            }
        }
    }

    let (summary, store, _dir) = run_supervised(
        vec![task("a", &[])],
        2,
        3,
        Some(Duration::from_millis(40)),
        Arc::new(DyingRunner),
        Arc::new(NeverHungJudge),
    )
    .await;

    assert_eq!(summary.completed, 1);
    let final_task = store.task(&TaskId::new("a")).await.unwrap();
    // The final diagnostic emitted during the grace window made it into
    // the failure record.
    assert!(final_task.failure_history[0]
        .output_tail
        .contains("schema version 7"));
}
