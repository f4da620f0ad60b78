//! Readiness-driven scheduler.
//!
//! The scheduler dispatches every ready task while a pool slot is free,
//! then blocks on the pool's event channel; each event re-triggers
//! dispatch. Dispatch is continuous, never wave-barrier-synchronous: a
//! task starts the instant its dependencies are Completed and a slot
//! frees, even while siblings of the same nominal wave are still running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::core::task::{FailureReason, TaskId};
use crate::error::{Error, Result};
use crate::flog;
use crate::orchestration::pool::{WorkerEvent, WorkerId, WorkerPool};
use crate::orchestration::resurrection::{FailureOutcome, ResurrectionManager};
use crate::orchestration::worker::{ExecutionRequest, WorkerFailure};
use crate::state::store::StateStore;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// External components (progress display, the sprint loop) react to these
/// without polling the store.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A task attempt was dispatched to a worker.
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
    },
    /// A task completed successfully.
    TaskCompleted { task_id: TaskId },
    /// A failed task was requeued with its resurrection context.
    TaskRetried {
        task_id: TaskId,
        attempt: u32,
        reason: String,
    },
    /// A task exhausted its retry budget and permanently failed.
    TaskFailed { task_id: TaskId, error: String },
    /// A task became blocked behind a failed dependency.
    TaskBlocked { task_id: TaskId },
    /// Nothing ready, nothing running, Pending tasks remained.
    Deadlocked { blocked: Vec<TaskId> },
    /// Every task reached a terminal state.
    AllTasksSettled,
}

/// Terminal accounting for one execution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    /// Whether the pass ended via the deadlock halt.
    pub deadlocked: bool,
}

/// Drives one task graph to quiescence.
pub struct Scheduler {
    store: Arc<StateStore>,
    pool: Arc<RwLock<WorkerPool>>,
    event_tx: mpsc::Sender<SchedulerEvent>,
    resurrection: ResurrectionManager,
    timeout_override: Option<Duration>,
    running: HashMap<WorkerId, TaskId>,
    deadlocked: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<StateStore>,
        pool: Arc<RwLock<WorkerPool>>,
        event_tx: mpsc::Sender<SchedulerEvent>,
        retry_limit: u32,
        timeout_override: Option<Duration>,
    ) -> Self {
        Self {
            store,
            pool,
            event_tx,
            resurrection: ResurrectionManager::new(retry_limit),
            timeout_override,
            running: HashMap::new(),
            deadlocked: false,
        }
    }

    /// The number of in-flight task attempts.
    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    /// Dispatch ready tasks up to the pool's capacity.
    ///
    /// Returns the number of tasks dispatched.
    pub async fn dispatch_ready(&mut self) -> Result<usize> {
        let ready = self.store.ready_tasks().await;
        let mut dispatched = 0;

        for task in ready {
            // Retry budget is enforced at failure time; this guard keeps a
            // task that somehow reappears from burning another slot.
            if task.attempt_count >= self.resurrection.retry_limit() {
                continue;
            }

            let has_capacity = {
                let pool = self.pool.read().await;
                pool.has_capacity()
            };
            if !has_capacity {
                break;
            }

            let attempt = task.attempt_count + 1;
            let request = ExecutionRequest {
                dependency_artifacts: self.store.dependency_artifacts(&task.id).await,
                resurrection: self.resurrection.package_for(&task),
                timeout: task.kill_timeout(self.timeout_override),
                task: task.clone(),
            };

            let worker_id = {
                let mut pool = self.pool.write().await;
                pool.spawn(request).await?
            };
            self.store.mark_running(&task.id).await?;
            self.running.insert(worker_id, task.id.clone());

            flog!(
                "dispatched task {} (attempt {}) to worker {}",
                task.id,
                attempt,
                worker_id.short()
            );
            let _ = self
                .event_tx
                .send(SchedulerEvent::TaskStarted {
                    task_id: task.id.clone(),
                    worker_id,
                    attempt,
                })
                .await;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Run until every task is terminal.
    ///
    /// Re-evaluates dispatch on every worker event, never on a timer. The
    /// deadlock halt (nothing running, nothing ready, Pending remain)
    /// blocks the remainder and reports it instead of spinning.
    pub async fn run(
        &mut self,
        worker_rx: &mut mpsc::Receiver<WorkerEvent>,
    ) -> Result<ExecutionSummary> {
        loop {
            if self.store.all_settled().await {
                let _ = self.event_tx.send(SchedulerEvent::AllTasksSettled).await;
                break;
            }

            let dispatched = self.dispatch_ready().await?;

            if self.running.is_empty() && dispatched == 0 {
                let startable = self.store.startable_ids().await;
                if startable.is_empty() {
                    if self.store.all_settled().await {
                        continue;
                    }
                    // Tasks marked Running in the store with no live
                    // worker: a snapshot resumed without requeueing.
                    return Err(Error::Validation(
                        "tasks marked running with no live workers; requeue interrupted tasks before scheduling".to_string(),
                    ));
                }
                let blocked = self
                    .store
                    .block_remaining("deadlocked: dependency can never be satisfied")
                    .await?;
                flog!("scheduler deadlocked; blocked set: {:?}", blocked);
                self.deadlocked = true;
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::Deadlocked { blocked })
                    .await;
                continue;
            }

            let Some(event) = worker_rx.recv().await else {
                return Err(Error::Validation(
                    "worker event channel closed mid-run".to_string(),
                ));
            };
            self.handle_event(event).await?;
        }

        let state = self.store.current_state().await;
        let completed = state
            .tasks
            .iter()
            .filter(|t| t.status == crate::core::task::TaskStatus::Completed)
            .count();
        let failed = state
            .tasks
            .iter()
            .filter(|t| matches!(t.status, crate::core::task::TaskStatus::Failed { .. }))
            .count();
        Ok(ExecutionSummary {
            completed,
            failed,
            blocked: state.blocked_count(),
            deadlocked: self.deadlocked,
        })
    }

    /// Process one worker event.
    pub async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Started { .. } => Ok(()),
            WorkerEvent::Completed {
                worker_id,
                task_id,
                report,
            } => {
                self.release(worker_id).await;
                self.store
                    .complete_task(
                        &task_id,
                        report.artifacts,
                        report.actual_complexity,
                        report.notes,
                    )
                    .await?;
                flog!("task {} completed", task_id);
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::TaskCompleted { task_id })
                    .await;
                Ok(())
            }
            WorkerEvent::Failed {
                worker_id,
                task_id,
                failure,
                output_tail,
            } => {
                self.release(worker_id).await;
                let (reason, detail) = match failure {
                    WorkerFailure::Explicit { message } => {
                        (FailureReason::ExplicitFailure, message)
                    }
                    WorkerFailure::Crash { detail } => (FailureReason::Crash, detail),
                    WorkerFailure::InvalidOutput { detail } => (
                        FailureReason::ExplicitFailure,
                        format!("output contract violation: {}", detail),
                    ),
                    WorkerFailure::Killed { detail } => (FailureReason::Timeout, detail),
                };
                self.apply_failure(task_id, reason, detail, output_tail).await
            }
            WorkerEvent::Killed {
                worker_id,
                task_id,
                reason,
                diagnostic,
            } => {
                self.release(worker_id).await;
                match reason.failure_reason() {
                    // Shutdown kills are run cancellation, not failures.
                    None => Ok(()),
                    Some(failure_reason) => {
                        self.apply_failure(task_id, failure_reason, reason.to_string(), diagnostic)
                            .await
                    }
                }
            }
        }
    }

    async fn apply_failure(
        &mut self,
        task_id: TaskId,
        reason: FailureReason,
        detail: String,
        output_tail: String,
    ) -> Result<()> {
        let outcome = self
            .resurrection
            .handle_failure(&self.store, &task_id, reason, detail.clone(), output_tail)
            .await?;
        match outcome {
            FailureOutcome::Requeued { attempt } => {
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::TaskRetried {
                        task_id,
                        attempt,
                        reason: detail,
                    })
                    .await;
            }
            FailureOutcome::FailedPermanently {
                error,
                newly_blocked,
            } => {
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::TaskFailed {
                        task_id,
                        error,
                    })
                    .await;
                for blocked in newly_blocked {
                    let _ = self
                        .event_tx
                        .send(SchedulerEvent::TaskBlocked { task_id: blocked })
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn release(&mut self, worker_id: WorkerId) {
        self.running.remove(&worker_id);
        let mut pool = self.pool.write().await;
        // The pool may already be cleared by terminate_all.
        let _ = pool.release(&worker_id);
    }
}
