//! Planning collaborator boundary.
//!
//! The planner is external: given the goal, accumulated context, and any
//! thrashing signal, it returns either a structured plan or a structured
//! request for clarification. Responses are validated eagerly at this
//! boundary - unknown shapes, unknown fields, unknown ids, or cycles are
//! rejected with the offending content, never coerced or partially
//! accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::task::{Complexity, Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::thrashing::ThrashingSignal;
use crate::util::truncate;

/// Request document sent to the planning collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    /// The goal to plan toward.
    pub goal: String,
    /// Accumulated cross-iteration narrative.
    pub context: String,
    /// Structural failure signal from the previous iteration, if any.
    pub thrashing: Option<ThrashingSignal>,
    /// Outer-loop iteration number (1-based).
    pub iteration: u32,
}

/// One task record in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub owner: String,
}

impl TaskSpec {
    /// Convert the spec into a pending task.
    pub fn into_task(self) -> Task {
        Task::new(self.id, &self.title, &self.description)
            .with_dependencies(self.dependencies.into_iter().map(TaskId::from).collect())
            .with_complexity(self.complexity)
            .with_owner(&self.owner)
    }
}

/// A validated response from the planning collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanResponse {
    /// A plan: task records forming (what should be) an acyclic graph.
    Plan { tasks: Vec<TaskSpec> },
    /// The planner needs input the core cannot supply.
    Clarification { questions: Vec<String> },
}

/// The planning collaborator seam.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
}

/// Parse and validate a raw planner response document.
///
/// The document must be a JSON object tagged `"type": "plan"` (with
/// `tasks`) or `"type": "clarification"` (with `questions`), and nothing
/// else. Violations surface the offending content.
pub fn parse_plan_response(raw: &str) -> Result<PlanResponse> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        Error::Validation(format!(
            "planner response is not JSON ({}): {}",
            e,
            truncate(raw, 200)
        ))
    })?;
    let obj = value.as_object().ok_or_else(|| {
        Error::Validation(format!(
            "planner response is not an object: {}",
            truncate(raw, 200)
        ))
    })?;
    let response_type = obj.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
        Error::Validation(format!(
            "planner response missing \"type\" tag: {}",
            truncate(raw, 200)
        ))
    })?;

    match response_type {
        "plan" => {
            reject_unknown_keys(obj, &["type", "tasks"], raw)?;
            let tasks_value = obj.get("tasks").ok_or_else(|| {
                Error::Validation(format!("plan response missing \"tasks\": {}", truncate(raw, 200)))
            })?;
            let tasks: Vec<TaskSpec> =
                serde_json::from_value(tasks_value.clone()).map_err(|e| {
                    Error::Validation(format!(
                        "plan task records do not match contract ({}): {}",
                        e,
                        truncate(raw, 200)
                    ))
                })?;
            Ok(PlanResponse::Plan { tasks })
        }
        "clarification" => {
            reject_unknown_keys(obj, &["type", "questions"], raw)?;
            let questions_value = obj.get("questions").ok_or_else(|| {
                Error::Validation(format!(
                    "clarification response missing \"questions\": {}",
                    truncate(raw, 200)
                ))
            })?;
            let questions: Vec<String> =
                serde_json::from_value(questions_value.clone()).map_err(|e| {
                    Error::Validation(format!(
                        "clarification questions do not match contract ({}): {}",
                        e,
                        truncate(raw, 200)
                    ))
                })?;
            Ok(PlanResponse::Clarification { questions })
        }
        other => Err(Error::Validation(format!(
            "unknown planner response type \"{}\": {}",
            other,
            truncate(raw, 200)
        ))),
    }
}

fn reject_unknown_keys(
    obj: &serde_json::Map<String, serde_json::Value>,
    allowed: &[&str],
    raw: &str,
) -> Result<()> {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(Error::Validation(format!(
                "unknown field \"{}\" in planner response: {}",
                key,
                truncate(raw, 200)
            )));
        }
    }
    Ok(())
}

/// Convert validated specs into tasks, ready for graph construction.
///
/// Graph-level validation (duplicate ids, unknown dependency ids, cycles)
/// happens in `TaskGraph::build`.
pub fn tasks_from_specs(specs: Vec<TaskSpec>) -> Vec<Task> {
    specs.into_iter().map(TaskSpec::into_task).collect()
}
