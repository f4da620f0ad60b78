//! The Reaper: supervision of live workers.
//!
//! One monitoring pass runs over every live worker at a fixed cadence.
//! Cheap deterministic checks (elapsed budget, output repetition,
//! heartbeat age, silence, process state) resolve the large majority of
//! cases; only when they are inconclusive does the Reaper escalate to the
//! expensive external judgment call. A confirmed hang turns into a kill
//! order on the worker's handle; the runner grants the bounded grace
//! window and then terminates the process unconditionally.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, System};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::task::FailureReason;
use crate::error::Result;
use crate::orchestration::pool::{WorkerHandle, WorkerPool};
use crate::{flog_debug, flog_warn};

/// Default cadence of monitoring passes.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Default startup window in which young, quiet workers are never judged.
pub const DEFAULT_STARTUP_GRACE_SECS: u64 = 60;

/// Default silence before a worker becomes suspect.
pub const DEFAULT_SILENCE_TIMEOUT_SECS: u64 = 900;

/// Default silence after which even a heartbeating worker is presumed dead.
pub const DEFAULT_HARD_SILENCE_SECS: u64 = 1800;

/// Default repetitions of one line within the window that mark a stuck loop.
pub const DEFAULT_LOOP_THRESHOLD: usize = 30;

/// Default window of recent lines inspected for repetition.
pub const DEFAULT_LOOP_WINDOW: usize = 50;

/// Configuration for worker supervision.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Cadence of monitoring passes over the pool.
    pub poll_interval: Duration,
    /// Elapsed time under which a quiet worker is left alone.
    pub startup_grace: Duration,
    /// Silence after which deterministic checks engage.
    pub silence_timeout: Duration,
    /// Silence after which no excuse (heartbeat, startup) holds.
    pub hard_silence: Duration,
    /// Grace granted to a killed worker for a final diagnostic.
    pub kill_grace: Duration,
    /// Repetition count that marks a stuck loop.
    pub loop_threshold: usize,
    /// Recent-line window inspected for repetition.
    pub loop_window: usize,
    /// Liveness marker workers may emit periodically.
    pub heartbeat_marker: String,
    /// Whether workers are expected to emit the marker at all.
    pub expect_heartbeat: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            startup_grace: Duration::from_secs(DEFAULT_STARTUP_GRACE_SECS),
            silence_timeout: Duration::from_secs(DEFAULT_SILENCE_TIMEOUT_SECS),
            hard_silence: Duration::from_secs(DEFAULT_HARD_SILENCE_SECS),
            kill_grace: Duration::from_secs(10),
            loop_threshold: DEFAULT_LOOP_THRESHOLD,
            loop_window: DEFAULT_LOOP_WINDOW,
            heartbeat_marker: "[HEARTBEAT]".to_string(),
            expect_heartbeat: false,
        }
    }
}

/// Why a kill order was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum KillReason {
    /// The attempt exceeded its kill threshold.
    Timeout { elapsed_secs: u64, limit_secs: u64 },
    /// Expected heartbeat marker missing or stale during a long silence.
    MissedHeartbeat { silence_secs: u64 },
    /// The same output line repeated past the loop threshold.
    OutputLoop { line: String, count: usize },
    /// The worker process itself is in a dead state.
    ProcessState { state: String },
    /// The external judgment call returned a hung verdict.
    Judged { reason: String },
    /// The whole run is being cancelled; not a task failure.
    Shutdown,
}

impl KillReason {
    /// Map to the failure taxonomy recorded on the task.
    ///
    /// Shutdown kills are run cancellation, not task failures, and produce
    /// no record.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            KillReason::Timeout { .. } | KillReason::MissedHeartbeat { .. } => {
                Some(FailureReason::Timeout)
            }
            KillReason::OutputLoop { .. }
            | KillReason::ProcessState { .. }
            | KillReason::Judged { .. } => Some(FailureReason::JudgedStalled),
            KillReason::Shutdown => None,
        }
    }
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::Timeout {
                elapsed_secs,
                limit_secs,
            } => write!(
                f,
                "exceeded kill threshold ({}s elapsed, {}s limit)",
                elapsed_secs, limit_secs
            ),
            KillReason::MissedHeartbeat { silence_secs } => {
                write!(f, "no live heartbeat after {}s of silence", silence_secs)
            }
            KillReason::OutputLoop { line, count } => {
                write!(f, "output loop: '{}' repeated {} times", line, count)
            }
            KillReason::ProcessState { state } => {
                write!(f, "process in dead state: {}", state)
            }
            KillReason::Judged { reason } => write!(f, "judged hung: {}", reason),
            KillReason::Shutdown => write!(f, "run cancelled"),
        }
    }
}

/// Verdict from the external judgment call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallVerdict {
    /// The worker is hung and should be killed.
    Hung { reason: String },
    /// The worker is still making progress.
    Active,
}

/// Context handed to the judgment call.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeContext {
    pub task_id: String,
    pub elapsed_secs: u64,
    pub silence_secs: u64,
    pub recent_output: String,
}

/// The expensive escalation path: evaluate ambiguous worker output in
/// context and return a hung/not-hung verdict. Kept rare by design.
#[async_trait]
pub trait StallJudge: Send + Sync {
    async fn judge(&self, context: &JudgeContext) -> Result<StallVerdict>;
}

/// Supervises all live workers in a pool.
pub struct Reaper {
    config: ReaperConfig,
    pool: Arc<RwLock<WorkerPool>>,
    judge: Arc<dyn StallJudge>,
    system: Mutex<System>,
}

impl Reaper {
    pub fn new(
        config: ReaperConfig,
        pool: Arc<RwLock<WorkerPool>>,
        judge: Arc<dyn StallJudge>,
    ) -> Self {
        Self {
            config,
            pool,
            judge,
            system: Mutex::new(System::new()),
        }
    }

    /// Get a reference to the reaper config.
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run monitoring passes at the configured cadence until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One monitoring pass: inspect every live worker, issue kill orders.
    ///
    /// Returns the kill orders issued, for observability and tests.
    pub async fn sweep(&self) -> Vec<(crate::orchestration::pool::WorkerId, KillReason)> {
        let handles = {
            let pool = self.pool.read().await;
            pool.handles()
        };
        let live: Vec<_> = handles.into_iter().filter(|h| !h.is_cancelled()).collect();

        let verdicts = future::join_all(live.iter().map(|handle| self.inspect(handle))).await;

        let mut kills = Vec::new();
        for (handle, verdict) in live.iter().zip(verdicts) {
            if let Some(reason) = verdict {
                flog_warn!(
                    "reaper killing worker {} (task {}): {}",
                    handle.id.short(),
                    handle.task_id,
                    reason
                );
                handle.kill(reason.clone());
                kills.push((handle.id, reason));
            }
        }
        kills
    }

    /// Inspect one worker. Deterministic checks in increasing cost order;
    /// the judgment call only fires when they are inconclusive.
    pub async fn inspect(&self, handle: &WorkerHandle) -> Option<KillReason> {
        let trace = handle.trace();
        let elapsed = trace.elapsed();
        let silence = trace.silence();

        // Kill threshold is absolute: no amount of output extends it.
        if elapsed >= handle.kill_timeout {
            return Some(KillReason::Timeout {
                elapsed_secs: elapsed.as_secs(),
                limit_secs: handle.kill_timeout.as_secs(),
            });
        }

        // Warn threshold is logged once, non-terminal.
        if elapsed >= handle.complexity.warn_after() && handle.mark_warned() {
            flog_warn!(
                "worker {} (task {}) past warn threshold for {} complexity ({}s elapsed)",
                handle.id.short(),
                handle.task_id,
                handle.complexity,
                elapsed.as_secs()
            );
        }

        // Startup tolerance: a young worker with little output is normal.
        if elapsed < self.config.startup_grace && trace.total_lines() < 3 {
            return None;
        }
        // A worker that has produced nothing at all gets the long startup
        // allowance; installs and slow initialization look exactly like this.
        if trace.total_lines() == 0 && elapsed < self.config.hard_silence {
            return None;
        }

        // Stuck-loop signature: the same line over and over.
        if let Some((line, count)) = trace.most_repeated_in_window(self.config.loop_window) {
            if count >= self.config.loop_threshold {
                return Some(KillReason::OutputLoop {
                    line: crate::util::truncate(&line, 60),
                    count,
                });
            }
        }

        // Anything still producing output within the silence window is alive.
        if silence < self.config.silence_timeout {
            return None;
        }

        // Process state: a zombie is dead regardless of anything else, and
        // any CPU use means the worker is computing without output.
        if let Some(pid) = trace.pid() {
            match self.process_probe(pid) {
                ProcessProbe::Dead { state } => {
                    return Some(KillReason::ProcessState { state });
                }
                ProcessProbe::Busy => return None,
                ProcessProbe::Idle | ProcessProbe::Unknown => {}
            }
        }

        // Heartbeat: a marker as the last output buys time up to the hard
        // ceiling; a missing or stale marker during long silence does not.
        if self.config.expect_heartbeat {
            match trace.lines_since(&self.config.heartbeat_marker) {
                Some(0) if silence < self.config.hard_silence => return None,
                _ => {
                    return Some(KillReason::MissedHeartbeat {
                        silence_secs: silence.as_secs(),
                    });
                }
            }
        }

        // Deterministic checks inconclusive: long silence, no CPU signal,
        // varied output. Escalate to the expensive judgment call.
        let context = JudgeContext {
            task_id: handle.task_id.to_string(),
            elapsed_secs: elapsed.as_secs(),
            silence_secs: silence.as_secs(),
            recent_output: trace.tail_joined(20),
        };
        match self.judge.judge(&context).await {
            Ok(StallVerdict::Hung { reason }) => Some(KillReason::Judged { reason }),
            Ok(StallVerdict::Active) => None,
            Err(e) => {
                // A failed judgment call never kills a worker.
                flog_debug!("stall judge error for {}: {}", handle.task_id, e);
                None
            }
        }
    }

    fn process_probe(&self, pid: u32) -> ProcessProbe {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        match system.process(Pid::from_u32(pid)) {
            Some(process) => match process.status() {
                ProcessStatus::Zombie | ProcessStatus::Dead => ProcessProbe::Dead {
                    state: format!("{:?}", process.status()).to_lowercase(),
                },
                _ if process.cpu_usage() > 0.0 => ProcessProbe::Busy,
                _ => ProcessProbe::Idle,
            },
            None => ProcessProbe::Unknown,
        }
    }
}

enum ProcessProbe {
    Dead { state: String },
    Busy,
    Idle,
    Unknown,
}
