//! Scheduling correctness: dependency order, capacity, continuous
//! dispatch, and the deadlock halt.

use std::time::{Duration, Instant};

use foreman::core::task::{TaskId, TaskStatus};
use foreman::core::TaskGraph;
use foreman::error::Error;
use foreman::orchestration::SchedulerEvent;

use crate::fixtures::{task, FakeOutcome, FakeRunner, SchedulerHarness};

#[tokio::test]
async fn test_every_acyclic_graph_reaches_quiescence() {
    // A layered graph with a few cross-edges; everything must settle.
    let tasks = vec![
        task("a", &[]),
        task("b", &[]),
        task("c", &["a"]),
        task("d", &["a", "b"]),
        task("e", &["c", "d"]),
        task("f", &["b"]),
    ];
    let mut h = SchedulerHarness::new(tasks, 3, 3, FakeRunner::new(Duration::from_millis(3)));

    let summary = h.scheduler.run(&mut h.worker_rx).await.unwrap();

    assert_eq!(summary.completed, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.blocked, 0);
    assert!(h.store.all_settled().await);
}

#[tokio::test]
async fn test_task_never_dispatched_before_dependencies_complete() {
    let mut h = SchedulerHarness::new(
        vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])],
        4,
        3,
        FakeRunner::new(Duration::from_millis(3)),
    );

    h.scheduler.run(&mut h.worker_rx).await.unwrap();
    let events = h.drain_events();

    // For every start event, the dependencies' completion events precede it.
    let position = |pred: &dyn Fn(&SchedulerEvent) -> bool| {
        events.iter().position(|e| pred(e)).expect("event present")
    };
    let completed =
        |id: &str| {
            let id = id.to_string();
            move |e: &SchedulerEvent| {
                matches!(e, SchedulerEvent::TaskCompleted { task_id } if task_id.as_str() == id)
            }
        };
    let started =
        |id: &str| {
            let id = id.to_string();
            move |e: &SchedulerEvent| {
                matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str() == id)
            }
        };

    assert!(position(&completed("a")) < position(&started("b")));
    assert!(position(&completed("b")) < position(&started("c")));
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max_parallel() {
    let tasks = vec![
        task("a", &[]),
        task("b", &[]),
        task("c", &[]),
        task("d", &[]),
        task("e", &[]),
    ];
    let mut h = SchedulerHarness::new(tasks, 2, 3, FakeRunner::new(Duration::from_millis(10)));

    h.scheduler.run(&mut h.worker_rx).await.unwrap();

    let max_seen = h
        .runner
        .max_in_flight
        .load(std::sync::atomic::Ordering::SeqCst);
    assert!(max_seen <= 2, "observed {} concurrent workers", max_seen);
    assert!(h.store.all_settled().await);
}

#[tokio::test]
async fn test_diamond_timing_is_readiness_driven() {
    // A and B run in parallel, C starts only after both: wall time tracks
    // max(A, B) + C, never A + B + C.
    let delay = Duration::from_millis(50);
    let mut h = SchedulerHarness::new(
        vec![task("a", &[]), task("b", &[]), task("c", &["a", "b"])],
        2,
        3,
        FakeRunner::new(delay),
    );

    let started = Instant::now();
    let summary = h.scheduler.run(&mut h.worker_rx).await.unwrap();
    let wall = started.elapsed();

    assert_eq!(summary.completed, 3);
    assert!(
        wall < delay * 3,
        "wall time {:?} suggests serial execution",
        wall
    );
    assert!(wall >= delay * 2, "wall time {:?} impossibly fast", wall);

    let events = h.drain_events();
    let c_started = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str() == "c"))
        .unwrap();
    let completions_before_c = events[..c_started]
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completions_before_c, 2);
}

#[tokio::test]
async fn test_cyclic_graph_rejected_before_any_dispatch() {
    let err = TaskGraph::build(vec![
        task("a", &["c"]),
        task("b", &["a"]),
        task("c", &["b"]),
    ])
    .unwrap_err();

    let msg = format!("{}", err);
    assert!(matches!(err, Error::Planning(_)));
    assert!(msg.contains("cycle"));
    // All three participants are named in the diagnostic.
    assert!(msg.contains('a') && msg.contains('b') && msg.contains('c'));
}

#[tokio::test]
async fn test_deadlock_halts_with_blocked_set_named() {
    // b and c wait on a, which is blocked before execution begins.
    let mut a = task("a", &[]);
    a.block("waiting on an external resource");

    let mut h = SchedulerHarness::new(
        vec![a, task("b", &["a"]), task("c", &["b"])],
        2,
        3,
        FakeRunner::new(Duration::from_millis(1)),
    );

    let summary = h.scheduler.run(&mut h.worker_rx).await.unwrap();

    assert!(summary.deadlocked);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.blocked, 3);

    let events = h.drain_events();
    let deadlock = events
        .iter()
        .find_map(|e| match e {
            SchedulerEvent::Deadlocked { blocked } => Some(blocked.clone()),
            _ => None,
        })
        .expect("deadlock event emitted");
    assert!(deadlock.contains(&TaskId::new("b")));
    assert!(deadlock.contains(&TaskId::new("c")));

    // The runner was never invoked: no dispatch happened.
    assert!(h.runner.requests.lock().unwrap().is_empty());

    // And the blocked tasks carry the deadlock diagnostic.
    let b = h.store.task(&TaskId::new("b")).await.unwrap();
    assert!(
        matches!(b.status, TaskStatus::Blocked { ref reason } if reason.contains("deadlocked"))
    );
}

#[tokio::test]
async fn test_waves_are_reporting_only() {
    // The wave grouping orders by depth, but dispatch does not wait for a
    // wave to finish: with capacity 2 and wave one being {a, b}, c (wave
    // two, depending only on a) starts while b is still running.
    let graph = TaskGraph::build(vec![
        task("a", &[]),
        task("b", &[]),
        task("c", &["a"]),
    ])
    .unwrap();
    let waves = graph.waves();
    assert_eq!(waves.len(), 2);
    assert_eq!(waves[0].len(), 2);
    assert_eq!(waves[1], vec![TaskId::new("c")]);

    // Make b slow by having its first attempt crash and retry; c must
    // start the moment a completes, while b is still in flight.
    let mut h = SchedulerHarness::new(
        vec![task("a", &[]), task("b-slow", &[]), task("c", &["a"])],
        2,
        3,
        FakeRunner::new(Duration::from_millis(15)).script(
            "b-slow",
            vec![
                FakeOutcome::Crash("first pass".to_string()),
                FakeOutcome::Succeed(vec![]),
            ],
        ),
    );

    h.scheduler.run(&mut h.worker_rx).await.unwrap();
    let events = h.drain_events();

    let c_started = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str() == "c"))
        .unwrap();
    let b_completed = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskCompleted { task_id } if task_id.as_str() == "b-slow"))
        .unwrap();
    assert!(
        c_started < b_completed,
        "c waited for its nominal wave to finish"
    );
}
