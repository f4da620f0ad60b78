//! Orchestration: scheduling, supervision, retry, and the outer loop.
//!
//! The scheduler dispatches ready tasks into a bounded worker pool; the
//! reaper supervises the workers; the resurrection manager recycles
//! failures into contextual retries; the thrashing detector flags plans
//! that are structurally wrong; the sprint loop drives the whole cycle
//! against the external planning and evaluation collaborators.

pub mod collab;
pub mod evaluator;
pub mod planner;
pub mod pool;
pub mod reaper;
pub mod resurrection;
pub mod scheduler;
pub mod sprint;
pub mod thrashing;
pub mod worker;

pub use collab::{ProcessCollaborator, ProcessEvaluator, ProcessPlanner, ProcessStallJudge};
pub use evaluator::{EvalRequest, Evaluator, Verdict};
pub use planner::{PlanRequest, PlanResponse, Planner, TaskSpec};
pub use pool::{WorkerEvent, WorkerHandle, WorkerId, WorkerPool};
pub use reaper::{JudgeContext, KillReason, Reaper, ReaperConfig, StallJudge, StallVerdict};
pub use resurrection::{FailureOutcome, ResurrectionManager, ResurrectionPackage};
pub use scheduler::{ExecutionSummary, Scheduler, SchedulerEvent};
pub use sprint::{SprintConfig, SprintLoop, SprintOutcome};
pub use thrashing::{ThrashingConfig, ThrashingDetector, ThrashingPattern, ThrashingSignal};
pub use worker::{
    ExecutionReport, ExecutionRequest, OutputTrace, ProcessRunner, TaskRunner, WorkerFailure,
};
