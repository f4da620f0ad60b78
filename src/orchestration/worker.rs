//! Worker execution: the seam to the external process that performs a task.
//!
//! The core never interprets what a worker does; it observes the output
//! stream, the exit status, and elapsed time. `OutputTrace` is the shared
//! telemetry the supervisor reads, and `TaskRunner` is the seam that tests
//! replace with fakes. `ProcessRunner` is the real implementation: it
//! spawns the configured command, streams its output, and parses the
//! structured trailer the worker must emit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Complexity, Task, TaskId};
use crate::error::{Error, Result};
use crate::flog_trace;
use crate::orchestration::resurrection::ResurrectionPackage;

/// Default number of output lines retained for diagnostics.
pub const DEFAULT_TRACE_CAPACITY: usize = 200;

/// Default grace given to a killed worker for a final diagnostic.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 10;

/// ANSI escape sequences, stripped from worker output before it reaches
/// the trace or the trailer parser.
static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

/// Remove terminal escape sequences from one output line.
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(line, "").into_owned()
}

/// Everything a worker needs to attempt a task.
///
/// Serialized as JSON onto the worker's stdin; the core prescribes the
/// document shape, never any prompt text.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    /// Snapshot of the task being attempted.
    pub task: Task,
    /// Artifacts of completed dependencies, keyed by task id.
    pub dependency_artifacts: HashMap<TaskId, Vec<String>>,
    /// Present on every attempt after the first: why predecessors died.
    pub resurrection: Option<ResurrectionPackage>,
    /// Kill threshold assigned to this attempt.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

mod duration_secs {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Structured result a worker reports on success.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionReport {
    /// Opaque result references.
    pub artifacts: Vec<String>,
    /// Complexity the work actually turned out to be.
    #[serde(default)]
    pub actual_complexity: Option<Complexity>,
    /// Free-form observations.
    #[serde(default)]
    pub notes: String,
}

/// Explicit failure trailer from a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FailureTrailer {
    error: String,
}

/// How a worker attempt ended short of a valid report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The attempt was cancelled (supervisor kill or timeout backstop).
    Killed { detail: String },
    /// The worker reported an explicit failure trailer.
    Explicit { message: String },
    /// The worker process exited abnormally.
    Crash { detail: String },
    /// The worker exited cleanly but its output had no valid trailer.
    InvalidOutput { detail: String },
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerFailure::Killed { detail } => write!(f, "killed: {}", detail),
            WorkerFailure::Explicit { message } => write!(f, "failed: {}", message),
            WorkerFailure::Crash { detail } => write!(f, "crashed: {}", detail),
            WorkerFailure::InvalidOutput { detail } => write!(f, "invalid output: {}", detail),
        }
    }
}

/// Shared telemetry for one running worker.
///
/// The runner pushes output lines in; the supervisor reads silence, tails,
/// repetition counts, and heartbeat ages out. All task-local, owned by the
/// worker's handle, never part of the run state.
pub struct OutputTrace {
    started: Instant,
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
    last_output: Mutex<Instant>,
    total_lines: AtomicUsize,
    pid: Mutex<Option<u32>>,
}

impl OutputTrace {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TRACE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            last_output: Mutex::new(now),
            total_lines: AtomicUsize::new(0),
            pid: Mutex::new(None),
        }
    }

    /// Record one output line from the worker.
    pub fn push_line(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
        drop(lines);
        *self.last_output.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.total_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the worker started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the last output line (or since start if silent so far).
    pub fn silence(&self) -> Duration {
        self.last_output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Total lines observed, including ones rotated out of the buffer.
    pub fn total_lines(&self) -> usize {
        self.total_lines.load(Ordering::Relaxed)
    }

    /// The last `n` retained lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().rev().take(n).rev().cloned().collect()
    }

    /// The last `n` retained lines joined with newlines.
    pub fn tail_joined(&self, n: usize) -> String {
        self.tail(n).join("\n")
    }

    /// How many lines ago the marker last appeared, if at all.
    pub fn lines_since(&self, marker: &str) -> Option<usize> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines
            .iter()
            .rev()
            .position(|line| line.contains(marker))
    }

    /// The most repeated line in the recent window and its count.
    pub fn most_repeated_in_window(&self, window: usize) -> Option<(String, usize)> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in lines.iter().rev().take(window) {
            *counts.entry(line.as_str()).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(line, count)| (line.to_string(), count))
    }

    /// Record the worker's process id for supervisor process checks.
    pub fn set_pid(&self, pid: u32) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = Some(pid);
    }

    /// The worker's process id, if known.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for OutputTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// The seam between the scheduler and the external worker process.
///
/// Implementations must observe the cancellation token: on cancellation,
/// allow a bounded grace window for a final diagnostic, then terminate
/// unconditionally and return `WorkerFailure::Killed`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        request: ExecutionRequest,
        trace: Arc<OutputTrace>,
        cancel: CancellationToken,
    ) -> std::result::Result<ExecutionReport, WorkerFailure>;
}

/// Parse the structured trailer from a worker's final output line.
///
/// The worker must end its output with a single JSON object: either a
/// report (`artifacts`/`actual_complexity`/`notes`) or an explicit failure
/// (`error`). Anything else is an error, never a silent empty result.
pub fn parse_trailer(
    lines: &[String],
) -> std::result::Result<ExecutionReport, WorkerFailure> {
    let Some(last) = lines.iter().rev().find(|l| !l.trim().is_empty()) else {
        return Err(WorkerFailure::InvalidOutput {
            detail: "worker produced no output".to_string(),
        });
    };
    let trimmed = last.trim();

    if let Ok(failure) = serde_json::from_str::<FailureTrailer>(trimmed) {
        return Err(WorkerFailure::Explicit {
            message: failure.error,
        });
    }
    match serde_json::from_str::<ExecutionReport>(trimmed) {
        Ok(report) => Ok(report),
        Err(e) => Err(WorkerFailure::InvalidOutput {
            detail: format!("trailer does not match contract ({}): {}", e, trimmed),
        }),
    }
}

/// Runs a task via an external worker process.
///
/// The request document goes to the worker on stdin as JSON; stdout and
/// stderr lines stream into the trace. The worker owns its own stdio and
/// timers; the process handle is released on every exit path.
#[derive(Debug)]
pub struct ProcessRunner {
    binary: PathBuf,
    args: Vec<String>,
    kill_grace: Duration,
}

impl ProcessRunner {
    /// Create a runner from a configured command string.
    ///
    /// The first token is resolved via `which`; the rest become arguments.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty worker command".to_string()))?;
        let binary = which::which(program)
            .map_err(|_| Error::BinaryNotFound(program.to_string()))?;
        Ok(Self {
            binary,
            args: parts.map(str::to_string).collect(),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
        })
    }

    /// Create a runner with an explicit binary path (tests, non-standard installs).
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
        }
    }

    /// Replace the argument list.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the grace window allowed for a final diagnostic before the
    /// process is killed unconditionally.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn run(
        &self,
        request: ExecutionRequest,
        trace: Arc<OutputTrace>,
        cancel: CancellationToken,
    ) -> std::result::Result<ExecutionReport, WorkerFailure> {
        let timeout = request.timeout;
        let request_json = serde_json::to_string(&request).map_err(|e| {
            WorkerFailure::Crash {
                detail: format!("could not serialize request: {}", e),
            }
        })?;

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerFailure::Crash {
                detail: format!("spawn failed: {}", e),
            })?;

        if let Some(pid) = child.id() {
            trace.set_pid(pid);
        }

        // Hand the request over; a worker that exits early may close its
        // stdin first, which is its prerogative.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(request_json.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);
        let mut stdout_lines = stdout.map(|r| r.lines());
        let mut stderr_lines = stderr.map(|r| r.lines());
        let mut stdout_open = stdout_lines.is_some();
        let mut stderr_open = stderr_lines.is_some();
        let mut collected: Vec<String> = Vec::new();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = async {
                    match stdout_lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                }, if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            let line = strip_ansi(&line);
                            flog_trace!("worker[{}] {}", request.task.id, line);
                            trace.push_line(&line);
                            collected.push(line);
                        }
                        _ => stdout_open = false,
                    }
                }
                line = async {
                    match stderr_lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                }, if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            let line = strip_ansi(&line);
                            trace.push_line(&line);
                            collected.push(line);
                        }
                        _ => stderr_open = false,
                    }
                }
                _ = &mut deadline => {
                    let detail = format!("exceeded kill threshold {:?}", timeout);
                    self.terminate(&mut child, &trace, &mut collected, &mut stdout_lines, &mut stderr_lines).await;
                    return Err(WorkerFailure::Killed { detail });
                }
                _ = cancel.cancelled() => {
                    self.terminate(&mut child, &trace, &mut collected, &mut stdout_lines, &mut stderr_lines).await;
                    return Err(WorkerFailure::Killed {
                        detail: "terminated by supervisor".to_string(),
                    });
                }
                status = child.wait(), if !stdout_open && !stderr_open => {
                    let status = status.map_err(|e| WorkerFailure::Crash {
                        detail: format!("wait failed: {}", e),
                    })?;
                    if !status.success() {
                        return Err(WorkerFailure::Crash {
                            detail: format!(
                                "exit code {}",
                                status.code().map_or("signal".to_string(), |c| c.to_string())
                            ),
                        });
                    }
                    return parse_trailer(&collected);
                }
            }
        }
    }
}

impl ProcessRunner {
    /// Kill path: bounded grace for a final diagnostic, then unconditional
    /// termination. Output captured during grace lands in the trace and is
    /// stored as failure context, never required for correctness.
    async fn terminate(
        &self,
        child: &mut tokio::process::Child,
        trace: &Arc<OutputTrace>,
        collected: &mut Vec<String>,
        stdout_lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
        stderr_lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStderr>>>,
    ) {
        let grace_read = async {
            if let Some(lines) = stdout_lines.as_mut() {
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = strip_ansi(&line);
                    trace.push_line(&line);
                    collected.push(line);
                }
            }
            if let Some(lines) = stderr_lines.as_mut() {
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = strip_ansi(&line);
                    trace.push_line(&line);
                    collected.push(line);
                }
            }
        };
        let _ = tokio::time::timeout(self.kill_grace, grace_read).await;
        let _ = child.kill().await;
    }
}
