//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work carried out by external worker
//! processes. Each task tracks its status, dependencies, attempt count,
//! artifacts, and the full history of failed attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a task within a graph.
///
/// Task ids are assigned by the planning collaborator and are opaque to
/// the core beyond equality and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
///
/// Tasks progress through these states as they are scheduled, executed,
/// retried, and settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet ready for execution.
    Pending,
    /// Task dependencies satisfied, ready to be dispatched.
    Ready,
    /// Task is currently being executed by a worker.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task permanently failed (retry budget exhausted or unrecoverable).
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task cannot proceed (failed dependency or unsatisfiable graph).
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// Complexity tier of a task, used only for timeout selection.
///
/// Each tier maps to a warn threshold (logged, non-terminal) and a kill
/// threshold (terminal, triggers supervisor termination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Small,
    Medium,
    Large,
    #[default]
    Unknown,
}

impl Complexity {
    /// Warn threshold: elapsed time after which a slow worker is logged.
    pub fn warn_after(&self) -> Duration {
        match self {
            Complexity::Trivial => Duration::from_secs(8 * 60),
            Complexity::Small => Duration::from_secs(20 * 60),
            Complexity::Medium => Duration::from_secs(60 * 60),
            Complexity::Large => Duration::from_secs(180 * 60),
            Complexity::Unknown => Duration::from_secs(60 * 60),
        }
    }

    /// Kill threshold: elapsed time after which the worker is terminated.
    pub fn kill_after(&self) -> Duration {
        match self {
            Complexity::Trivial => Duration::from_secs(20 * 60),
            Complexity::Small => Duration::from_secs(60 * 60),
            Complexity::Medium => Duration::from_secs(180 * 60),
            Complexity::Large => Duration::from_secs(480 * 60),
            Complexity::Unknown => Duration::from_secs(240 * 60),
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Trivial => write!(f, "trivial"),
            Complexity::Small => write!(f, "small"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Large => write!(f, "large"),
            Complexity::Unknown => write!(f, "unknown"),
        }
    }
}

/// Why an attempt at a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker exceeded its kill threshold.
    Timeout,
    /// The worker process exited abnormally.
    Crash,
    /// The supervisor judged the worker stalled (loop, zombie, or verdict).
    JudgedStalled,
    /// The worker reported an explicit failure.
    ExplicitFailure,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Crash => write!(f, "crash"),
            FailureReason::JudgedStalled => write!(f, "judged-stalled"),
            FailureReason::ExplicitFailure => write!(f, "explicit-failure"),
        }
    }
}

/// Record of one failed attempt at a task.
///
/// Failure records are appended in order and consumed deterministically by
/// the resurrection manager when the next attempt is packaged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Which attempt this was (1-based).
    pub attempt: u32,
    /// When the attempt ended.
    pub timestamp: DateTime<Utc>,
    /// Why the attempt failed.
    pub reason: FailureReason,
    /// Specific diagnostic for this failure (kill reason, exit status, ...).
    pub detail: String,
    /// Tail of the worker's output at the time of failure (bounded).
    pub output_tail: String,
    /// Artifacts produced before the failure.
    pub artifacts: Vec<String>,
}

/// A single task in the execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the graph.
    pub id: TaskId,
    /// Short human-readable title (opaque to the core).
    pub title: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Ids of tasks that must complete before this one starts.
    pub dependencies: Vec<TaskId>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Number of failed attempts so far.
    pub attempt_count: u32,
    /// Complexity tier, used for timeout selection only.
    pub complexity: Complexity,
    /// Assignment tag, passed through to the worker, never interpreted.
    pub owner: String,
    /// Opaque result references reported by the worker.
    pub artifacts: Vec<String>,
    /// Ordered history of failed attempts.
    pub failure_history: Vec<FailureRecord>,
    /// Complexity the worker reported after actually doing the work.
    pub actual_complexity: Option<Complexity>,
    /// Free-form notes from the worker's structured result.
    pub notes: String,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the current (or last) attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task settled (success or permanent failure).
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: impl Into<TaskId>, title: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: description.to_string(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            complexity: Complexity::Unknown,
            owner: String::new(),
            artifacts: Vec::new(),
            failure_history: Vec::new(),
            actual_complexity: None,
            notes: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the dependency list (builder style).
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the complexity tier (builder style).
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set the owner tag (builder style).
    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = owner.to_string();
        self
    }

    /// Start an attempt: transitions to Running and records the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed with the worker's results.
    pub fn complete(
        &mut self,
        artifacts: Vec<String>,
        actual_complexity: Option<Complexity>,
        notes: String,
    ) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        if !artifacts.is_empty() {
            self.artifacts = artifacts;
        }
        self.actual_complexity = actual_complexity;
        if !notes.is_empty() {
            self.notes = notes;
        }
    }

    /// Mark the task as permanently failed.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as blocked.
    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    /// Mark the task as ready for dispatch.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Return a failed attempt to the queue for resurrection.
    ///
    /// The failure history is kept; only the status and start time reset.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }

    /// Append a failure record and increment the attempt counter.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.attempt_count += 1;
        self.failure_history.push(record);
    }

    /// Kill threshold for this task: explicit override or complexity tier.
    pub fn kill_timeout(&self, override_timeout: Option<Duration>) -> Duration {
        override_timeout.unwrap_or_else(|| self.complexity.kill_after())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Check if the task can be dispatched (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}
