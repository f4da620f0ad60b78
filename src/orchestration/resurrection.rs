//! Resurrection: retrying failed tasks with their failure context.
//!
//! A fresh attempt is never indistinguishable from the first: it carries
//! the full failure history, tactical hints synthesized from the failure
//! pattern, and any partial artifacts. At the retry limit the task is
//! permanently failed and its dependents are blocked, never silently
//! completed.

use serde::{Deserialize, Serialize};

use crate::core::task::{FailureReason, FailureRecord, Task, TaskId};
use crate::error::Result;
use crate::flog;
use crate::state::store::{FailureDisposition, StateStore};
use crate::util::truncate;

/// Bound on the output tail captured into a failure record.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Context injected into every attempt after the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResurrectionPackage {
    /// The attempt about to run (1-based; 2 for the first resurrection).
    pub attempt: u32,
    /// Every prior failure, in order.
    pub history: Vec<FailureRecord>,
    /// Tactical hints synthesized from the failure pattern.
    pub hints: Vec<String>,
    /// Artifacts the predecessors produced before dying.
    pub partial_artifacts: Vec<String>,
}

/// What became of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Budget remains: the task was requeued for another attempt.
    Requeued { attempt: u32 },
    /// Budget exhausted: the task is permanently failed.
    FailedPermanently {
        error: String,
        newly_blocked: Vec<TaskId>,
    },
}

/// Applies the retry policy to worker failures.
pub struct ResurrectionManager {
    retry_limit: u32,
}

impl ResurrectionManager {
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// The configured retry limit.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Record a failed attempt and decide its disposition.
    pub async fn handle_failure(
        &self,
        store: &StateStore,
        task_id: &TaskId,
        reason: FailureReason,
        detail: String,
        output_tail: String,
    ) -> Result<FailureOutcome> {
        let task = store.task(task_id).await?;
        let attempt = task.attempt_count + 1;
        let record = FailureRecord {
            attempt,
            timestamp: chrono::Utc::now(),
            reason,
            detail: detail.clone(),
            output_tail: truncate(&output_tail, OUTPUT_TAIL_CHARS),
            artifacts: task.artifacts.clone(),
        };

        if attempt < self.retry_limit {
            store
                .resolve_failure(task_id, record, FailureDisposition::Requeue)
                .await?;
            flog!(
                "task {} attempt {} failed ({}): requeued, {} attempts left",
                task_id,
                attempt,
                reason,
                self.retry_limit - attempt
            );
            Ok(FailureOutcome::Requeued { attempt })
        } else {
            let error = format!(
                "retry limit reached after {} attempts; last failure: {} ({})",
                attempt, reason, detail
            );
            let newly_blocked = store
                .resolve_failure(
                    task_id,
                    record,
                    FailureDisposition::FailPermanently {
                        error: error.clone(),
                    },
                )
                .await?;
            flog!(
                "task {} permanently failed after {} attempts; {} dependents blocked",
                task_id,
                attempt,
                newly_blocked.len()
            );
            Ok(FailureOutcome::FailedPermanently {
                error,
                newly_blocked,
            })
        }
    }

    /// Build the resurrection package for a task's next attempt.
    ///
    /// Returns None for a first attempt: only resurrected tasks carry one.
    pub fn package_for(&self, task: &Task) -> Option<ResurrectionPackage> {
        if task.failure_history.is_empty() {
            return None;
        }
        Some(ResurrectionPackage {
            attempt: task.attempt_count + 1,
            history: task.failure_history.clone(),
            hints: synthesize_hints(&task.failure_history),
            partial_artifacts: task.artifacts.clone(),
        })
    }
}

/// Derive tactical hints by pattern-matching across the failure history.
///
/// Deterministic: the same history always yields the same hints.
pub fn synthesize_hints(history: &[FailureRecord]) -> Vec<String> {
    let mut hints = Vec::new();
    if history.is_empty() {
        return hints;
    }

    let timeouts = history
        .iter()
        .filter(|r| r.reason == FailureReason::Timeout)
        .count();
    let stalls = history
        .iter()
        .filter(|r| r.reason == FailureReason::JudgedStalled)
        .count();
    let crashes = history
        .iter()
        .filter(|r| r.reason == FailureReason::Crash)
        .count();

    if timeouts >= 2 {
        hints.push(format!(
            "{} attempts exceeded their time budget; the current approach is too slow - take a smaller or different path instead of retrying the same steps",
            timeouts
        ));
    } else if timeouts == 1 {
        hints.push(
            "the previous attempt hit its kill threshold; start from the partial work instead of redoing everything"
                .to_string(),
        );
    }

    if stalls >= 2 {
        hints.push(format!(
            "{} attempts stalled without progress; whatever step they got stuck on must be avoided or replaced",
            stalls
        ));
    } else if stalls == 1 {
        if let Some(record) = history
            .iter()
            .rev()
            .find(|r| r.reason == FailureReason::JudgedStalled)
        {
            hints.push(format!(
                "the previous attempt stalled ({}); do not repeat that step",
                record.detail
            ));
        }
    }

    if crashes >= 2 {
        hints.push(format!(
            "{} attempts crashed; validate inputs and environment before doing the main work",
            crashes
        ));
    }

    // A failure detail that recurs verbatim marks a step to steer around.
    for (i, record) in history.iter().enumerate() {
        let repeats = history[i + 1..]
            .iter()
            .filter(|r| r.detail == record.detail)
            .count();
        if repeats >= 1 && !record.detail.is_empty() {
            hints.push(format!(
                "the same failure recurred across attempts: {}",
                record.detail
            ));
            break;
        }
    }

    if let Some(last) = history.last() {
        if last.reason == FailureReason::ExplicitFailure {
            hints.push(format!(
                "the previous attempt reported: {}",
                last.detail
            ));
        }
    }

    hints
}
