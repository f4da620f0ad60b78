//! Worker pool for bounded parallel execution.
//!
//! The `WorkerPool` enforces the max-concurrent limit, owns the handle for
//! every live worker, and emits `WorkerEvent`s on its channel as attempts
//! finish. The scheduler consumes the events; the reaper reads the handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::task::{Complexity, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::reaper::KillReason;
use crate::orchestration::worker::{
    ExecutionReport, ExecutionRequest, OutputTrace, TaskRunner, WorkerFailure,
};

/// Unique identifier for one worker (one attempt at one task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Create a new unique worker identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events emitted by the pool as worker attempts finish.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker began executing a task attempt.
    Started {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    /// The worker finished and its trailer parsed as a report.
    Completed {
        worker_id: WorkerId,
        task_id: TaskId,
        report: ExecutionReport,
    },
    /// The worker failed on its own (crash, explicit failure, bad trailer).
    Failed {
        worker_id: WorkerId,
        task_id: TaskId,
        failure: WorkerFailure,
        output_tail: String,
    },
    /// The worker was terminated by a kill order (or its timeout backstop).
    Killed {
        worker_id: WorkerId,
        task_id: TaskId,
        reason: KillReason,
        /// Final diagnostic: output tail including anything emitted during
        /// the kill-grace window. Best-effort.
        diagnostic: String,
    },
}

/// Handle to one live worker.
///
/// Carries the shared telemetry the reaper reads and the cancellation
/// token a kill order fires. Cloning shares the same underlying worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub task_id: TaskId,
    pub complexity: Complexity,
    pub kill_timeout: Duration,
    trace: Arc<OutputTrace>,
    cancel: CancellationToken,
    kill_reason: Arc<Mutex<Option<KillReason>>>,
    warned: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        task_id: TaskId,
        complexity: Complexity,
        kill_timeout: Duration,
        trace: Arc<OutputTrace>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            task_id,
            complexity,
            kill_timeout,
            trace,
            cancel,
            kill_reason: Arc::new(Mutex::new(None)),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The worker's output telemetry.
    pub fn trace(&self) -> &Arc<OutputTrace> {
        &self.trace
    }

    /// Issue a kill order: record the reason, then cancel.
    ///
    /// The runner observes the cancellation, grants the grace window, and
    /// terminates the process unconditionally.
    pub fn kill(&self, reason: KillReason) {
        let mut slot = self.kill_reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.cancel.cancel();
    }

    /// The recorded kill reason, if a kill order was issued.
    pub fn kill_reason(&self) -> Option<KillReason> {
        self.kill_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mark the warn threshold as logged. Returns true the first time.
    pub fn mark_warned(&self) -> bool {
        !self.warned.swap(true, Ordering::SeqCst)
    }

    /// Whether a kill order has been issued.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("complexity", &self.complexity)
            .finish()
    }
}

/// Manages a bounded pool of concurrent workers.
pub struct WorkerPool {
    workers: HashMap<WorkerId, WorkerHandle>,
    max_concurrent: usize,
    event_tx: mpsc::Sender<WorkerEvent>,
    runner: Arc<dyn TaskRunner>,
}

impl WorkerPool {
    /// Create a new pool with the given capacity.
    pub fn new(
        max_concurrent: usize,
        event_tx: mpsc::Sender<WorkerEvent>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            workers: HashMap::new(),
            max_concurrent,
            event_tx,
            runner,
        }
    }

    /// Spawn a worker for a task attempt.
    ///
    /// The runner executes on its own tokio task; its outcome arrives as a
    /// `WorkerEvent` on the pool's channel. The pool slot stays occupied
    /// until the scheduler calls `release`.
    ///
    /// # Errors
    /// Returns an error if the pool is at capacity.
    pub async fn spawn(&mut self, request: ExecutionRequest) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_concurrent,
            });
        }

        let worker_id = WorkerId::new();
        let task_id = request.task.id.clone();
        let trace = Arc::new(OutputTrace::new());
        let cancel = CancellationToken::new();
        let handle = WorkerHandle::new(
            worker_id,
            task_id.clone(),
            request.task.complexity,
            request.timeout,
            Arc::clone(&trace),
            cancel.clone(),
        );
        self.workers.insert(worker_id, handle.clone());

        let _ = self
            .event_tx
            .send(WorkerEvent::Started {
                worker_id,
                task_id: task_id.clone(),
            })
            .await;

        let runner = Arc::clone(&self.runner);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = runner.run(request, Arc::clone(&trace), cancel).await;
            let event = match result {
                Ok(report) => WorkerEvent::Completed {
                    worker_id,
                    task_id,
                    report,
                },
                Err(WorkerFailure::Killed { detail: _ }) => {
                    // A recorded reason means the reaper killed it; absent
                    // that, the runner's own deadline fired.
                    let reason = handle.kill_reason().unwrap_or(KillReason::Timeout {
                        elapsed_secs: trace.elapsed().as_secs(),
                        limit_secs: handle.kill_timeout.as_secs(),
                    });
                    WorkerEvent::Killed {
                        worker_id,
                        task_id,
                        reason,
                        diagnostic: trace.tail_joined(20),
                    }
                }
                Err(failure) => WorkerEvent::Failed {
                    worker_id,
                    task_id,
                    failure,
                    output_tail: trace.tail_joined(20),
                },
            };
            let _ = event_tx.send(event).await;
        });

        Ok(worker_id)
    }

    /// Release a worker's slot after its terminal event was handled.
    pub fn release(&mut self, id: &WorkerId) -> Result<()> {
        if self.workers.remove(id).is_none() {
            return Err(Error::WorkerNotFound { id: *id });
        }
        Ok(())
    }

    /// Get a worker's handle by id.
    pub fn get(&self, id: &WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(id)
    }

    /// Clone out the handles of all live workers.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers.values().cloned().collect()
    }

    /// The number of occupied slots.
    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether a slot is free.
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    /// The configured maximum concurrent workers.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Issue a shutdown kill to every live worker.
    ///
    /// Whole-run cancellation: every external process receives its kill
    /// order before control returns to the caller.
    pub fn terminate_all(&mut self) {
        for handle in self.workers.values() {
            handle.kill(KillReason::Shutdown);
        }
        self.workers.clear();
    }
}
