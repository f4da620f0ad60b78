//! StateStore - the single source of truth for run state.
//!
//! Every status transition, artifact attachment, and failure-record append
//! goes through the store. A write lock serializes transitions, and a
//! durable snapshot is written atomically (temp file + rename) before the
//! lock is released, so an external observer or a restart always sees a
//! consistent, recent state. Worker code never mutates state directly.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::core::graph::TaskGraph;
use crate::core::task::{Complexity, FailureRecord, FailureReason, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::flog_debug;
use crate::state::run_state::RunState;

/// What the resurrection manager decided to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry budget remains: the task returns to Pending for another attempt.
    Requeue,
    /// Retry budget exhausted: the task is permanently failed and its
    /// transitive dependents become Blocked.
    FailPermanently { error: String },
}

#[derive(Debug)]
struct Inner {
    graph: TaskGraph,
    goal: String,
    iteration: u32,
    narrative: String,
    total_kills: u32,
    prev_blocked_count: usize,
}

/// Concurrency-safe owner of one iteration's run state.
#[derive(Debug)]
pub struct StateStore {
    inner: RwLock<Inner>,
    snapshot_path: PathBuf,
}

impl StateStore {
    /// Open a store over a fresh or carried-forward run state.
    ///
    /// Writes the initial snapshot immediately so the run is resumable
    /// from its very first moment.
    pub fn open(state: RunState, snapshot_path: PathBuf) -> Result<Self> {
        let inner = Inner {
            graph: TaskGraph::build(state.tasks)?,
            goal: state.goal,
            iteration: state.iteration,
            narrative: state.narrative,
            total_kills: state.total_kills,
            prev_blocked_count: state.prev_blocked_count,
        };
        let store = Self {
            inner: RwLock::new(inner),
            snapshot_path,
        };
        {
            let guard = store.inner.try_read().map_err(|_| {
                Error::Validation("state store locked during open".to_string())
            })?;
            store.write_snapshot(&guard)?;
        }
        Ok(store)
    }

    /// Load a store back from a snapshot written by a previous run.
    pub fn load(snapshot_path: &Path) -> Result<Self> {
        flog_debug!("StateStore::load path={}", snapshot_path.display());
        let contents = fs::read_to_string(snapshot_path)?;
        let state: RunState = serde_json::from_str(&contents)?;
        Self::open(state, snapshot_path.to_path_buf())
    }

    /// Path the store snapshots to.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    fn write_snapshot(&self, inner: &Inner) -> Result<()> {
        let state = RunState {
            goal: inner.goal.clone(),
            iteration: inner.iteration,
            narrative: inner.narrative.clone(),
            total_kills: inner.total_kills,
            prev_blocked_count: inner.prev_blocked_count,
            tasks: inner.graph.all_tasks().into_iter().cloned().collect(),
            updated_at: Utc::now(),
        };
        let mut contents = serde_json::to_string_pretty(&state)?;
        contents.push('\n');
        write_atomic(&self.snapshot_path, &contents)
    }

    // ========== Transitions ==========

    /// Mark a task Running (dispatch).
    pub async fn mark_running(&self, id: &TaskId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .graph
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        task.start();
        self.write_snapshot(&inner)
    }

    /// Mark a task Completed with the worker's reported results.
    pub async fn complete_task(
        &self,
        id: &TaskId,
        artifacts: Vec<String>,
        actual_complexity: Option<Complexity>,
        notes: String,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .graph
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        task.complete(artifacts, actual_complexity, notes);
        self.write_snapshot(&inner)
    }

    /// Record a failed attempt and apply the resurrection manager's
    /// disposition in one atomic transition.
    ///
    /// Returns the ids of dependents newly blocked by a permanent failure.
    pub async fn resolve_failure(
        &self,
        id: &TaskId,
        record: FailureRecord,
        disposition: FailureDisposition,
    ) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.write().await;
        let is_kill = matches!(
            record.reason,
            FailureReason::Timeout | FailureReason::JudgedStalled
        );

        let task = inner
            .graph
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        task.record_failure(record);

        let mut newly_blocked = Vec::new();
        match disposition {
            FailureDisposition::Requeue => task.requeue(),
            FailureDisposition::FailPermanently { error } => {
                task.fail(&error);
                for dep_id in inner.graph.transitive_dependents(id) {
                    if let Some(dependent) = inner.graph.get_task_mut(&dep_id) {
                        if !dependent.is_terminal() {
                            dependent.block(&format!("dependency {} failed", id));
                            newly_blocked.push(dep_id);
                        }
                    }
                }
            }
        }

        if is_kill {
            inner.total_kills += 1;
        }
        self.write_snapshot(&inner)?;
        Ok(newly_blocked)
    }

    /// Block every still-startable task, naming the deadlock.
    ///
    /// Used by the scheduler's halt path when nothing is running, nothing
    /// is ready, and Pending tasks remain.
    pub async fn block_remaining(&self, reason: &str) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.write().await;
        let stuck: Vec<TaskId> = inner
            .graph
            .all_tasks()
            .iter()
            .filter(|t| t.can_start())
            .map(|t| t.id.clone())
            .collect();
        for id in &stuck {
            if let Some(task) = inner.graph.get_task_mut(id) {
                task.block(reason);
            }
        }
        self.write_snapshot(&inner)?;
        Ok(stuck)
    }

    /// Requeue tasks that were Running when a previous process died.
    ///
    /// Only used on resume; a loaded snapshot is otherwise kept verbatim.
    pub async fn requeue_interrupted(&self) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.write().await;
        let interrupted: Vec<TaskId> = inner
            .graph
            .all_tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        for id in &interrupted {
            if let Some(task) = inner.graph.get_task_mut(id) {
                task.requeue();
            }
        }
        if !interrupted.is_empty() {
            self.write_snapshot(&inner)?;
        }
        Ok(interrupted)
    }

    /// Append a line to the cross-iteration narrative.
    pub async fn append_narrative(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.narrative.is_empty() {
            inner.narrative.push('\n');
        }
        inner.narrative.push_str(text);
        self.write_snapshot(&inner)
    }

    // ========== Queries ==========

    /// Snapshot of a single task.
    pub async fn task(&self, id: &TaskId) -> Result<Task> {
        let inner = self.inner.read().await;
        inner
            .graph
            .get_task(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    /// Snapshots of all tasks ready to dispatch.
    pub async fn ready_tasks(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        inner.graph.ready_tasks().into_iter().cloned().collect()
    }

    /// Artifacts of a task's completed dependencies, keyed by task id.
    pub async fn dependency_artifacts(&self, id: &TaskId) -> HashMap<TaskId, Vec<String>> {
        let inner = self.inner.read().await;
        inner
            .graph
            .dependencies_of(id)
            .into_iter()
            .filter(|dep| dep.status == TaskStatus::Completed)
            .map(|dep| (dep.id.clone(), dep.artifacts.clone()))
            .collect()
    }

    /// Whether every task is terminal.
    pub async fn all_settled(&self) -> bool {
        self.inner.read().await.graph.all_settled()
    }

    /// Ids of startable (Pending/Ready) tasks.
    pub async fn startable_ids(&self) -> Vec<TaskId> {
        let inner = self.inner.read().await;
        inner
            .graph
            .all_tasks()
            .iter()
            .filter(|t| t.can_start())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Derived wave grouping for progress display.
    pub async fn waves(&self) -> Vec<Vec<TaskId>> {
        self.inner.read().await.graph.waves()
    }

    /// The goal of this iteration.
    pub async fn goal(&self) -> String {
        self.inner.read().await.goal.clone()
    }

    /// The iteration number.
    pub async fn iteration(&self) -> u32 {
        self.inner.read().await.iteration
    }

    /// Clone out the full run state document.
    pub async fn current_state(&self) -> RunState {
        let inner = self.inner.read().await;
        RunState {
            goal: inner.goal.clone(),
            iteration: inner.iteration,
            narrative: inner.narrative.clone(),
            total_kills: inner.total_kills,
            prev_blocked_count: inner.prev_blocked_count,
            tasks: inner.graph.all_tasks().into_iter().cloned().collect(),
            updated_at: Utc::now(),
        }
    }
}

/// Atomically replace `path` with `contents` (temp file + rename), so a
/// crash mid-write never truncates the previous durable state.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::Validation(format!("snapshot path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(parent)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
