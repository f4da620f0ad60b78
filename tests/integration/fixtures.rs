//! Test fixtures for integration tests.
//!
//! Provides fake collaborators (runner, planner, evaluator, stall judge)
//! so the suites run without any external processes, plus harness helpers
//! for wiring a scheduler over a temporary state store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use foreman::core::task::{Task, TaskId};
use foreman::error::{Error, Result};
use foreman::orchestration::{
    EvalRequest, Evaluator, ExecutionReport, ExecutionRequest, JudgeContext, OutputTrace,
    PlanRequest, PlanResponse, Planner, Scheduler, SchedulerEvent, StallJudge, StallVerdict,
    TaskRunner, TaskSpec, Verdict, WorkerEvent, WorkerFailure, WorkerPool,
};
use foreman::state::{RunState, StateStore};

/// One scripted behavior for a fake worker attempt.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Succeed after the delay with these artifacts.
    Succeed(Vec<String>),
    /// Crash after the delay.
    Crash(String),
    /// Report an explicit failure after the delay.
    ExplicitFail(String),
    /// Produce a little output, then hang until killed.
    Hang,
}

/// Worker runner with scripted per-task outcome queues.
///
/// Consecutive attempts at a task consume the queue; the last entry
/// repeats. Unknown tasks succeed immediately.
pub struct FakeRunner {
    delay: Duration,
    scripts: Mutex<HashMap<String, Vec<FakeOutcome>>>,
    /// Live attempts right now, and the maximum ever observed.
    in_flight: AtomicUsize,
    pub max_in_flight: Arc<AtomicUsize>,
    /// Requests seen, in dispatch order.
    pub requests: Mutex<Vec<ExecutionRequest>>,
}

impl FakeRunner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, task_id: &str, outcomes: Vec<FakeOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), outcomes);
        self
    }

    pub fn requests_for(&self, task_id: &str) -> Vec<ExecutionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.task.id.as_str() == task_id)
            .cloned()
            .collect()
    }

    fn next_outcome(&self, task_id: &str) -> FakeOutcome {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(task_id) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue
                .first()
                .cloned()
                .unwrap_or(FakeOutcome::Succeed(vec![])),
            None => FakeOutcome::Succeed(vec![]),
        }
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run(
        &self,
        request: ExecutionRequest,
        trace: Arc<OutputTrace>,
        cancel: CancellationToken,
    ) -> std::result::Result<ExecutionReport, WorkerFailure> {
        self.requests.lock().unwrap().push(request.clone());

        let live = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(live, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        trace.push_line("working");
        let outcome = self.next_outcome(request.task.id.as_str());
        match outcome {
            FakeOutcome::Succeed(artifacts) => {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => Ok(ExecutionReport {
                        artifacts,
                        actual_complexity: None,
                        notes: String::new(),
                    }),
                    _ = cancel.cancelled() => Err(WorkerFailure::Killed {
                        detail: "terminated by supervisor".to_string(),
                    }),
                }
            }
            FakeOutcome::Crash(detail) => {
                tokio::time::sleep(self.delay).await;
                Err(WorkerFailure::Crash { detail })
            }
            FakeOutcome::ExplicitFail(message) => {
                tokio::time::sleep(self.delay).await;
                Err(WorkerFailure::Explicit { message })
            }
            FakeOutcome::Hang => {
                trace.push_line("about to hang");
                cancel.cancelled().await;
                Err(WorkerFailure::Killed {
                    detail: "terminated by supervisor".to_string(),
                })
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Planner replaying scripted responses and recording requests.
pub struct FakePlanner {
    responses: Mutex<Vec<Result<PlanResponse>>>,
    pub requests: Mutex<Vec<PlanRequest>>,
}

impl FakePlanner {
    pub fn new(responses: Vec<Result<PlanResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for FakePlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(Error::Validation("planner script exhausted".to_string()));
        }
        responses.remove(0)
    }
}

/// Evaluator replaying scripted verdicts (the last one repeats).
pub struct FakeEvaluator {
    verdicts: Mutex<Vec<Verdict>>,
    pub requests: Mutex<Vec<EvalRequest>>,
}

impl FakeEvaluator {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<EvalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, request: &EvalRequest) -> Result<Verdict> {
        self.requests.lock().unwrap().push(request.clone());
        let mut verdicts = self.verdicts.lock().unwrap();
        if verdicts.len() > 1 {
            Ok(verdicts.remove(0))
        } else {
            verdicts
                .first()
                .cloned()
                .ok_or_else(|| Error::Validation("evaluator script exhausted".to_string()))
        }
    }
}

/// Judge that always finds the worker active.
pub struct NeverHungJudge;

#[async_trait]
impl StallJudge for NeverHungJudge {
    async fn judge(&self, _context: &JudgeContext) -> Result<StallVerdict> {
        Ok(StallVerdict::Active)
    }
}

/// Create a test task with dependencies.
pub fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, &format!("{} title", id), &format!("{} description", id))
        .with_dependencies(deps.iter().map(|d| TaskId::new(*d)).collect())
}

/// Create a plan task spec with dependencies.
pub fn spec(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        title: format!("{} title", id),
        description: String::new(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        complexity: Default::default(),
        owner: String::new(),
    }
}

pub fn success_verdict() -> Verdict {
    Verdict {
        success: true,
        reasoning: "goal met".to_string(),
        follow_up_goal: None,
    }
}

pub fn failure_verdict(follow_up: &str) -> Verdict {
    Verdict {
        success: false,
        reasoning: "not there yet".to_string(),
        follow_up_goal: Some(follow_up.to_string()),
    }
}

/// Scheduler harness over a temporary state store and a fake runner.
pub struct SchedulerHarness {
    pub _dir: TempDir,
    pub store: Arc<StateStore>,
    pub pool: Arc<RwLock<WorkerPool>>,
    pub scheduler: Scheduler,
    pub worker_rx: mpsc::Receiver<WorkerEvent>,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
    pub runner: Arc<FakeRunner>,
}

impl SchedulerHarness {
    pub fn new(
        tasks: Vec<Task>,
        max_parallel: usize,
        retry_limit: u32,
        runner: FakeRunner,
    ) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run_state.json");
        let store = Arc::new(
            StateStore::open(RunState::new("test goal", 1, tasks), path).expect("open store"),
        );
        let runner = Arc::new(runner);
        let (worker_tx, worker_rx) = mpsc::channel(256);
        let pool = Arc::new(RwLock::new(WorkerPool::new(
            max_parallel,
            worker_tx,
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
        )));
        let (event_tx, event_rx) = mpsc::channel(256);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            event_tx,
            retry_limit,
            None,
        );
        Self {
            _dir: dir,
            store,
            pool,
            scheduler,
            worker_rx,
            event_rx,
            runner,
        }
    }

    /// Drain all scheduler events currently queued.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_runner_scripted_queue() {
        let runner = FakeRunner::new(Duration::from_millis(1)).script(
            "a",
            vec![
                FakeOutcome::Crash("boom".to_string()),
                FakeOutcome::Succeed(vec!["out".to_string()]),
            ],
        );
        assert!(matches!(runner.next_outcome("a"), FakeOutcome::Crash(_)));
        assert!(matches!(runner.next_outcome("a"), FakeOutcome::Succeed(_)));
        // Last entry repeats.
        assert!(matches!(runner.next_outcome("a"), FakeOutcome::Succeed(_)));
        // Unknown tasks succeed.
        assert!(matches!(runner.next_outcome("z"), FakeOutcome::Succeed(_)));
    }

    #[tokio::test]
    async fn test_harness_builds() {
        let harness = SchedulerHarness::new(
            vec![task("a", &[]), task("b", &["a"])],
            2,
            3,
            FakeRunner::new(Duration::from_millis(1)),
        );
        assert_eq!(harness.store.ready_tasks().await.len(), 1);
    }
}
