//! Thrashing detection: failure patterns that mean the plan is wrong.
//!
//! The detector observes the live run state and flags structural problems.
//! It never retries anything itself; its signal is folded into the next
//! planning request so the external planner is forced to change strategy
//! rather than re-issue the same plan.

use serde::{Deserialize, Serialize};

use crate::core::task::{TaskId, TaskStatus};
use crate::state::run_state::RunState;

/// Default failed-attempt count that marks a single task as thrashing.
pub const DEFAULT_KILL_THRESHOLD: u32 = 3;

/// Default blocked-task count that marks the graph as obstructed.
pub const DEFAULT_BLOCKED_THRESHOLD: usize = 2;

/// Default completion floor checked after enough iterations.
pub const DEFAULT_PROGRESS_FLOOR: f64 = 0.3;

/// Default iteration count after which the progress floor applies.
pub const DEFAULT_STALL_ITERATIONS: u32 = 4;

/// Thresholds for the thrashing patterns.
#[derive(Debug, Clone)]
pub struct ThrashingConfig {
    /// Failed attempts on one task before it is structurally suspect.
    pub kill_threshold: u32,
    /// Blocked tasks, sustained across iterations, before the graph is.
    pub blocked_threshold: usize,
    /// Minimum completion fraction expected after `stall_iterations`.
    pub progress_floor: f64,
    /// Iterations before the progress floor is enforced.
    pub stall_iterations: u32,
}

impl Default for ThrashingConfig {
    fn default() -> Self {
        Self {
            kill_threshold: DEFAULT_KILL_THRESHOLD,
            blocked_threshold: DEFAULT_BLOCKED_THRESHOLD,
            progress_floor: DEFAULT_PROGRESS_FLOOR,
            stall_iterations: DEFAULT_STALL_ITERATIONS,
        }
    }
}

/// Which structural pattern tripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "pattern")]
pub enum ThrashingPattern {
    /// One or more tasks keep dying and being retried.
    RepeatedKills {
        tasks: Vec<TaskId>,
        max_attempts: u32,
    },
    /// Blocked-task count stayed high across more than one iteration.
    SustainedBlockage {
        blocked: Vec<TaskId>,
        previous_count: usize,
    },
    /// Overall completion stayed under the floor for too many iterations.
    StalledProgress { completion: f64, iteration: u32 },
}

/// Structured signal the sprint loop folds into the next planning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrashingSignal {
    /// The patterns that tripped.
    pub patterns: Vec<ThrashingPattern>,
    /// Every task implicated by any pattern.
    pub implicated: Vec<TaskId>,
    /// Terse narrative for the planner.
    pub narrative: String,
}

/// Evaluates the thrashing patterns against a run state.
#[derive(Debug, Clone, Default)]
pub struct ThrashingDetector {
    config: ThrashingConfig,
}

impl ThrashingDetector {
    pub fn new(config: ThrashingConfig) -> Self {
        Self { config }
    }

    /// Check the run state for structural failure patterns.
    ///
    /// Returns None while the run merely looks unlucky rather than wrong.
    pub fn evaluate(&self, state: &RunState) -> Option<ThrashingSignal> {
        let mut patterns = Vec::new();
        let mut narrative_parts = Vec::new();

        // Pattern (a): a single task killed/failed and retried repeatedly.
        let thrashing_tasks: Vec<(&TaskId, u32)> = state
            .tasks
            .iter()
            .filter(|t| t.attempt_count >= self.config.kill_threshold)
            .map(|t| (&t.id, t.attempt_count))
            .collect();
        if !thrashing_tasks.is_empty() {
            let ids: Vec<TaskId> = thrashing_tasks.iter().map(|(id, _)| (*id).clone()).collect();
            let max_attempts = thrashing_tasks.iter().map(|(_, n)| *n).max().unwrap_or(0);
            narrative_parts.push(format!(
                "tasks failed {}+ times: {}; the current approach to them is not working",
                self.config.kill_threshold,
                ids.iter()
                    .map(TaskId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            patterns.push(ThrashingPattern::RepeatedKills {
                tasks: ids,
                max_attempts,
            });
        }

        // Pattern (b): blockage sustained across more than one iteration.
        let blocked: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Blocked { .. }))
            .map(|t| t.id.clone())
            .collect();
        if state.iteration >= 2
            && blocked.len() >= self.config.blocked_threshold
            && state.prev_blocked_count >= self.config.blocked_threshold
        {
            narrative_parts.push(format!(
                "{} tasks blocked for a second iteration running: {}",
                blocked.len(),
                blocked
                    .iter()
                    .map(TaskId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            patterns.push(ThrashingPattern::SustainedBlockage {
                blocked,
                previous_count: state.prev_blocked_count,
            });
        }

        // Pattern (c): completion stayed under the floor for too long.
        let completion = state.completion_fraction();
        if state.iteration >= self.config.stall_iterations
            && completion < self.config.progress_floor
        {
            narrative_parts.push(format!(
                "after {} iterations only {:.0}% of tasks are complete; the plan needs a rethink, not another pass",
                state.iteration,
                completion * 100.0
            ));
            patterns.push(ThrashingPattern::StalledProgress {
                completion,
                iteration: state.iteration,
            });
        }

        if patterns.is_empty() {
            return None;
        }

        let mut implicated: Vec<TaskId> = patterns
            .iter()
            .flat_map(|p| match p {
                ThrashingPattern::RepeatedKills { tasks, .. } => tasks.clone(),
                ThrashingPattern::SustainedBlockage { blocked, .. } => blocked.clone(),
                ThrashingPattern::StalledProgress { .. } => Vec::new(),
            })
            .collect();
        implicated.sort();
        implicated.dedup();

        Some(ThrashingSignal {
            patterns,
            implicated,
            narrative: narrative_parts.join(" "),
        })
    }
}
