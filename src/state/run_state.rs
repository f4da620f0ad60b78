//! The persisted run-state document.
//!
//! One `RunState` describes one execution iteration: the goal, the tasks
//! with their live statuses and failure histories, and the narrative
//! carried across iterations. It is written atomically after every
//! transition and is the sole mechanism for resuming an interrupted run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// The goal this iteration is working toward.
    pub goal: String,
    /// Outer-loop iteration number (1-based).
    pub iteration: u32,
    /// Accumulated cross-iteration narrative, fed back into planning.
    #[serde(default)]
    pub narrative: String,
    /// Total supervisor kills across the whole run.
    #[serde(default)]
    pub total_kills: u32,
    /// Blocked-task count at the end of the previous iteration.
    #[serde(default)]
    pub prev_blocked_count: usize,
    /// The tasks of the current graph (edges derive from dependency lists).
    pub tasks: Vec<Task>,
    /// Last snapshot time.
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Create the state for a fresh iteration.
    pub fn new(goal: &str, iteration: u32, tasks: Vec<Task>) -> Self {
        Self {
            goal: goal.to_string(),
            iteration,
            narrative: String::new(),
            total_kills: 0,
            prev_blocked_count: 0,
            tasks,
            updated_at: Utc::now(),
        }
    }

    /// Fraction of tasks completed, in [0, 1]. Empty graphs count as done.
    pub fn completion_fraction(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        completed as f64 / self.tasks.len() as f64
    }

    /// Number of currently blocked tasks.
    pub fn blocked_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Blocked { .. }))
            .count()
    }

    /// Check whether every task is terminal.
    pub fn all_settled(&self) -> bool {
        self.tasks.iter().all(Task::is_terminal)
    }

    /// Render the human-readable terminal summary.
    ///
    /// This is what the evaluation collaborator sees, and what gets folded
    /// into the next planning request on an unsuccessful iteration.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Goal: {}\n", self.goal));
        out.push_str(&format!("Iteration: {}\n", self.iteration));

        let completed: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let failed: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .collect();
        let blocked: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Blocked { .. }))
            .collect();

        out.push_str(&format!(
            "Tasks: {} total, {} completed, {} failed, {} blocked\n",
            self.tasks.len(),
            completed.len(),
            failed.len(),
            blocked.len()
        ));

        if !completed.is_empty() {
            out.push_str("\nCompleted:\n");
            for task in &completed {
                out.push_str(&format!("- {}: {}", task.id, task.title));
                if !task.artifacts.is_empty() {
                    out.push_str(&format!(" (artifacts: {})", task.artifacts.join(", ")));
                }
                out.push('\n');
            }
        }

        if !failed.is_empty() {
            out.push_str("\nFailed:\n");
            for task in &failed {
                if let TaskStatus::Failed { error } = &task.status {
                    out.push_str(&format!(
                        "- {}: {} ({} attempts): {}\n",
                        task.id, task.title, task.attempt_count, error
                    ));
                }
                for record in &task.failure_history {
                    out.push_str(&format!(
                        "    attempt {}: {} - {}\n",
                        record.attempt, record.reason, record.detail
                    ));
                }
            }
        }

        if !blocked.is_empty() {
            out.push_str("\nBlocked:\n");
            for task in &blocked {
                if let TaskStatus::Blocked { reason } = &task.status {
                    out.push_str(&format!("- {}: {} ({})\n", task.id, task.title, reason));
                }
            }
        }

        if self.total_kills > 0 {
            out.push_str(&format!("\nSupervisor kills this run: {}\n", self.total_kills));
        }

        if !self.narrative.is_empty() {
            out.push_str(&format!("\nHistory:\n{}\n", self.narrative));
        }

        out
    }
}
