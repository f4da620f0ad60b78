//! Evaluation collaborator boundary.
//!
//! The evaluator is external: given the goal and the terminal run-state
//! summary, it returns a verdict. A "not achieved" verdict must carry a
//! specific follow-up objective; one without it is a contract defect and
//! must never silently terminate the loop as successful.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::truncate;

/// Request document sent to the evaluation collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct EvalRequest {
    /// The goal the run was working toward.
    pub goal: String,
    /// Human-readable summary of the terminal run state.
    pub summary: String,
}

/// The evaluator's verdict on an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verdict {
    /// Whether the goal was judged achieved.
    pub success: bool,
    /// Why.
    pub reasoning: String,
    /// The follow-up objective seeding the next iteration's planning.
    /// Required whenever `success` is false.
    #[serde(default)]
    pub follow_up_goal: Option<String>,
}

/// The evaluation collaborator seam.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvalRequest) -> Result<Verdict>;
}

/// Parse and validate a raw verdict document.
pub fn parse_verdict(raw: &str) -> Result<Verdict> {
    let verdict: Verdict = serde_json::from_str(raw).map_err(|e| {
        Error::Validation(format!(
            "evaluator verdict does not match contract ({}): {}",
            e,
            truncate(raw, 200)
        ))
    })?;

    if !verdict.success
        && verdict
            .follow_up_goal
            .as_deref()
            .map_or(true, |g| g.trim().is_empty())
    {
        return Err(Error::Validation(format!(
            "evaluator returned success=false without a follow_up_goal: {}",
            truncate(raw, 200)
        )));
    }

    Ok(verdict)
}
