//! The sprint loop: plan, execute, evaluate, iterate.
//!
//! Drives `Planning -> Executing -> Evaluating -> {Succeeded | Iterating |
//! Exhausted}` until the external evaluator judges the goal achieved or
//! the iteration budget runs out. Failure context accumulates across
//! iterations: the narrative, the thrashing signal, and the evaluator's
//! follow-up objective all seed the next planning request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_PARALLEL, DEFAULT_RETRY_LIMIT};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::evaluator::{EvalRequest, Evaluator};
use crate::orchestration::planner::{tasks_from_specs, PlanRequest, PlanResponse, Planner};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::reaper::{Reaper, ReaperConfig, StallJudge};
use crate::orchestration::scheduler::{ExecutionSummary, Scheduler, SchedulerEvent};
use crate::orchestration::thrashing::{ThrashingConfig, ThrashingDetector, ThrashingSignal};
use crate::orchestration::worker::TaskRunner;
use crate::state::run_state::RunState;
use crate::state::store::StateStore;
use crate::{flog, flog_warn};

/// Identical follow-up goals tolerated before the loop is declared stuck.
const REPEATED_GOAL_LIMIT: usize = 3;

/// Configuration for the outer loop.
#[derive(Debug, Clone)]
pub struct SprintConfig {
    /// Maximum concurrently running workers.
    pub max_parallel: usize,
    /// Iteration budget; None means run until success.
    pub max_iterations: Option<u32>,
    /// Failed attempts allowed per task.
    pub retry_limit: u32,
    /// Explicit kill timeout overriding complexity tiers.
    pub timeout_override: Option<Duration>,
    /// Supervisor tuning.
    pub reaper: ReaperConfig,
    /// Thrashing thresholds.
    pub thrashing: ThrashingConfig,
    /// Where run-state snapshots are written.
    pub snapshot_path: PathBuf,
}

impl SprintConfig {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
            retry_limit: DEFAULT_RETRY_LIMIT,
            timeout_override: None,
            reaper: ReaperConfig::default(),
            thrashing: ThrashingConfig::default(),
            snapshot_path,
        }
    }
}

/// Terminal outcome of a whole run.
///
/// Every variant carries the final run state and an explanation; a run
/// never ends with a bare exit and no diagnostic.
#[derive(Debug)]
pub enum SprintOutcome {
    /// The evaluator judged the goal achieved.
    Succeeded {
        state: RunState,
        reasoning: String,
        iterations: u32,
    },
    /// The iteration budget ran out (or the loop was stuck or cancelled).
    Exhausted {
        state: RunState,
        reason: String,
        iterations: u32,
    },
    /// The planner returned something unrecoverable.
    PlanningFailed {
        state: Option<RunState>,
        error: String,
    },
}

/// The outer orchestrator.
pub struct SprintLoop {
    config: SprintConfig,
    planner: Arc<dyn Planner>,
    evaluator: Arc<dyn Evaluator>,
    judge: Arc<dyn StallJudge>,
    runner: Arc<dyn TaskRunner>,
    detector: ThrashingDetector,
}

impl SprintLoop {
    pub fn new(
        config: SprintConfig,
        planner: Arc<dyn Planner>,
        evaluator: Arc<dyn Evaluator>,
        judge: Arc<dyn StallJudge>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        let detector = ThrashingDetector::new(config.thrashing.clone());
        Self {
            config,
            planner,
            evaluator,
            judge,
            runner,
            detector,
        }
    }

    /// Run from a fresh goal until a terminal outcome.
    pub async fn run(
        &self,
        goal: &str,
        context: &str,
        cancel: CancellationToken,
    ) -> Result<SprintOutcome> {
        self.drive(goal.to_string(), context.to_string(), None, cancel)
            .await
    }

    /// Resume an interrupted run from its snapshot.
    ///
    /// Tasks that were Running when the previous process died are
    /// requeued; everything else resumes exactly where the snapshot
    /// left it.
    pub async fn resume(&self, cancel: CancellationToken) -> Result<SprintOutcome> {
        let store = Arc::new(StateStore::load(&self.config.snapshot_path)?);
        let interrupted = store.requeue_interrupted().await?;
        if !interrupted.is_empty() {
            flog!(
                "resume: requeued {} interrupted tasks: {:?}",
                interrupted.len(),
                interrupted
            );
        }
        let state = store.current_state().await;
        self.drive(state.goal.clone(), state.narrative.clone(), Some(store), cancel)
            .await
    }

    async fn drive(
        &self,
        original_goal: String,
        initial_context: String,
        resume_store: Option<Arc<StateStore>>,
        cancel: CancellationToken,
    ) -> Result<SprintOutcome> {
        let mut current_goal = original_goal.clone();
        let mut narrative = initial_context;
        let mut iteration: u32 = match &resume_store {
            Some(store) => store.iteration().await.saturating_sub(1),
            None => 0,
        };
        let mut total_kills: u32 = 0;
        let mut prev_blocked: usize = 0;
        let mut thrashing: Option<ThrashingSignal> = None;
        let mut recent_goals: Vec<String> = Vec::new();
        let mut last_state: Option<RunState> = None;
        let mut pending_store = resume_store;

        loop {
            iteration += 1;
            if let Some(max) = self.config.max_iterations {
                if iteration > max {
                    let completed = iteration - 1;
                    flog!("iteration budget of {} exhausted", max);
                    return Ok(SprintOutcome::Exhausted {
                        state: last_state
                            .unwrap_or_else(|| RunState::new(&current_goal, completed, vec![])),
                        reason: format!(
                            "iteration budget of {} reached without achieving the goal",
                            max
                        ),
                        iterations: completed,
                    });
                }
            }

            // Planning (skipped when resuming into an existing graph).
            let store = match pending_store.take() {
                Some(store) => store,
                None => {
                    flog!("iteration {} planning: {}", iteration, current_goal);
                    let request = PlanRequest {
                        goal: current_goal.clone(),
                        context: narrative.clone(),
                        thrashing: thrashing.take(),
                        iteration,
                    };
                    let tasks = match self.planner.plan(&request).await {
                        Ok(PlanResponse::Plan { tasks }) => tasks_from_specs(tasks),
                        Ok(PlanResponse::Clarification { questions }) => {
                            // With no operator in the loop, a clarification
                            // request cannot be answered.
                            return Ok(SprintOutcome::PlanningFailed {
                                state: last_state,
                                error: format!(
                                    "planner needs clarification: {}",
                                    questions.join("; ")
                                ),
                            });
                        }
                        Err(e) => {
                            flog_warn!("iteration {} planning failed: {}", iteration, e);
                            narrative = fold(
                                narrative,
                                &format!("Iteration {}: planning failed: {}", iteration, e),
                            );
                            continue;
                        }
                    };

                    let mut state = RunState::new(&current_goal, iteration, tasks);
                    state.narrative = narrative.clone();
                    state.total_kills = total_kills;
                    state.prev_blocked_count = prev_blocked;

                    // Graph validation happens at store construction; a
                    // cyclic or inconsistent plan burns this iteration.
                    match StateStore::open(state, self.config.snapshot_path.clone()) {
                        Ok(store) => Arc::new(store),
                        Err(e @ (Error::Planning(_) | Error::Validation(_))) => {
                            flog_warn!("iteration {} plan rejected: {}", iteration, e);
                            narrative = fold(
                                narrative,
                                &format!("Iteration {}: plan rejected: {}", iteration, e),
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            // Executing: run the graph to quiescence.
            let exec_result = self.execute(Arc::clone(&store), cancel.child_token()).await;
            let state_doc = store.current_state().await;
            total_kills = state_doc.total_kills;
            last_state = Some(state_doc.clone());

            if cancel.is_cancelled() {
                return Ok(SprintOutcome::Exhausted {
                    state: state_doc,
                    reason: "run cancelled".to_string(),
                    iterations: iteration,
                });
            }
            let summary = exec_result?;

            // Evaluating: freeze, summarize, ask for the verdict.
            let verdict = match self
                .evaluator
                .evaluate(&EvalRequest {
                    goal: current_goal.clone(),
                    summary: state_doc.summary(),
                })
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    flog_warn!("iteration {} evaluation failed: {}", iteration, e);
                    narrative = fold(
                        narrative,
                        &format!("Iteration {}: evaluation failed: {}", iteration, e),
                    );
                    prev_blocked = state_doc.blocked_count();
                    continue;
                }
            };

            if verdict.success {
                store
                    .append_narrative(&format!(
                        "Iteration {}: goal achieved. {}",
                        iteration, verdict.reasoning
                    ))
                    .await?;
                flog!("goal achieved after {} iteration(s)", iteration);
                return Ok(SprintOutcome::Succeeded {
                    state: store.current_state().await,
                    reasoning: verdict.reasoning,
                    iterations: iteration,
                });
            }

            let follow_up = verdict
                .follow_up_goal
                .filter(|g| !g.trim().is_empty())
                .unwrap_or_else(|| format!("Complete remaining work for: {}", original_goal));

            // A follow-up goal that keeps coming back unchanged means the
            // approach is impossible, not unlucky.
            let similar = recent_goals
                .iter()
                .rev()
                .take(REPEATED_GOAL_LIMIT - 1)
                .filter(|g| goals_similar(g, &follow_up))
                .count();
            if iteration >= REPEATED_GOAL_LIMIT as u32 && similar >= REPEATED_GOAL_LIMIT - 1 {
                return Ok(SprintOutcome::Exhausted {
                    state: state_doc,
                    reason: format!(
                        "follow-up goal repeated {} times without progress: {}",
                        REPEATED_GOAL_LIMIT, follow_up
                    ),
                    iterations: iteration,
                });
            }
            recent_goals.push(follow_up.clone());

            // The thrashing signal, if any, rides into the next plan.
            thrashing = self.detector.evaluate(&state_doc);
            if let Some(signal) = &thrashing {
                flog_warn!("thrashing detected: {}", signal.narrative);
            }

            narrative = fold(
                narrative,
                &format!(
                    "Iteration {}: {}/{} tasks completed, {} failed, {} blocked{}. Evaluator: {} Follow-up: {}",
                    iteration,
                    summary.completed,
                    state_doc.tasks.len(),
                    summary.failed,
                    summary.blocked,
                    if summary.deadlocked { " (deadlocked)" } else { "" },
                    verdict.reasoning,
                    follow_up
                ),
            );
            if let Some(signal) = &thrashing {
                narrative = fold(narrative, &format!("Thrashing: {}", signal.narrative));
            }

            prev_blocked = state_doc.blocked_count();
            current_goal = follow_up;
        }
    }

    /// Execute one graph to quiescence with supervision.
    async fn execute(
        &self,
        store: Arc<StateStore>,
        cancel: CancellationToken,
    ) -> Result<ExecutionSummary> {
        let waves = store.waves().await;
        flog!(
            "executing {} wave(s): {:?}",
            waves.len(),
            waves
                .iter()
                .map(|w| w.iter().map(TaskId::as_str).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        );

        let (worker_tx, mut worker_rx) = mpsc::channel(256);
        let pool = Arc::new(RwLock::new(WorkerPool::new(
            self.config.max_parallel,
            worker_tx,
            Arc::clone(&self.runner),
        )));

        let reaper = Reaper::new(
            self.config.reaper.clone(),
            Arc::clone(&pool),
            Arc::clone(&self.judge),
        );
        let reaper_cancel = CancellationToken::new();
        let reaper_task = tokio::spawn(reaper.run(reaper_cancel.clone()));

        let (event_tx, event_rx) = mpsc::channel(256);
        let progress_task = tokio::spawn(log_progress(event_rx));

        let mut scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            event_tx,
            self.config.retry_limit,
            self.config.timeout_override,
        );

        let result = tokio::select! {
            result = scheduler.run(&mut worker_rx) => result,
            _ = cancel.cancelled() => {
                flog_warn!("execution cancelled; terminating all workers");
                Err(Error::Validation("run cancelled".to_string()))
            }
        };

        // Teardown on every path: stop the reaper, kill any stragglers,
        // close the event stream.
        reaper_cancel.cancel();
        let _ = reaper_task.await;
        {
            let mut pool = pool.write().await;
            pool.terminate_all();
        }
        drop(scheduler);
        let _ = progress_task.await;

        result
    }
}

fn fold(narrative: String, line: &str) -> String {
    if narrative.is_empty() {
        line.to_string()
    } else {
        format!("{}\n{}", narrative, line)
    }
}

/// Two goals count as similar when one contains the other.
fn goals_similar(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

async fn log_progress(mut rx: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted {
                task_id, attempt, ..
            } => {
                if attempt > 1 {
                    flog!("task {} resurrected (attempt {})", task_id, attempt);
                } else {
                    flog!("task {} started", task_id);
                }
            }
            SchedulerEvent::TaskCompleted { task_id } => flog!("task {} completed", task_id),
            SchedulerEvent::TaskRetried {
                task_id,
                attempt,
                reason,
            } => flog!("task {} failed attempt {} ({}), retrying", task_id, attempt, reason),
            SchedulerEvent::TaskFailed { task_id, error } => {
                flog_warn!("task {} permanently failed: {}", task_id, error);
            }
            SchedulerEvent::TaskBlocked { task_id } => {
                flog_warn!("task {} blocked", task_id);
            }
            SchedulerEvent::Deadlocked { blocked } => {
                flog_warn!("deadlock: blocked set {:?}", blocked);
            }
            SchedulerEvent::AllTasksSettled => flog!("all tasks settled"),
        }
    }
}
