//! Process-backed collaborator implementations.
//!
//! Each external collaborator (planner, evaluator, stall judge) is a
//! configured command invoked the same way: the request document goes in
//! as JSON on stdin, one JSON document comes back on stdout, bounded by a
//! timeout. The core never formats prompt text; what the command does with
//! the request is its own business.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::flog_debug;
use crate::orchestration::evaluator::{EvalRequest, Evaluator, Verdict};
use crate::orchestration::planner::{PlanRequest, Planner, PlanResponse};
use crate::orchestration::reaper::{JudgeContext, StallJudge, StallVerdict};
use crate::orchestration::{evaluator, planner};
use crate::util::truncate;

/// Default timeout for a collaborator call (10 minutes).
pub const DEFAULT_COLLAB_TIMEOUT_SECS: u64 = 600;

/// Shared plumbing for invoking a collaborator command.
#[derive(Debug, Clone)]
pub struct ProcessCollaborator {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessCollaborator {
    /// Create from a configured command string.
    ///
    /// The first token is resolved via `which`; the rest become arguments.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty collaborator command".to_string()))?;
        let binary = which::which(program)
            .map_err(|_| Error::BinaryNotFound(program.to_string()))?;
        Ok(Self {
            binary,
            args: parts.map(str::to_string).collect(),
            timeout: Duration::from_secs(DEFAULT_COLLAB_TIMEOUT_SECS),
        })
    }

    /// Create with an explicit binary path (tests, non-standard installs).
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_COLLAB_TIMEOUT_SECS),
        }
    }

    /// Replace the argument list.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set a custom timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke the command in the given mode with a JSON payload on stdin.
    ///
    /// Returns the trimmed stdout document.
    pub async fn invoke(&self, mode: &str, payload: &str) -> Result<String> {
        flog_debug!(
            "collaborator invoke: {} {} ({} bytes in)",
            self.binary.display(),
            mode,
            payload.len()
        );

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg(mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Validation(format!(
                "collaborator {} exited with {}: {}",
                mode,
                output
                    .status
                    .code()
                    .map_or("signal".to_string(), |c| c.to_string()),
                truncate(stderr.trim(), 200)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Planning collaborator backed by an external command.
pub struct ProcessPlanner {
    process: ProcessCollaborator,
}

impl ProcessPlanner {
    pub fn new(command: &str) -> Result<Self> {
        Ok(Self {
            process: ProcessCollaborator::new(command)?,
        })
    }

    pub fn from_process(process: ProcessCollaborator) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Planner for ProcessPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let payload = serde_json::to_string(request)?;
        let raw = self.process.invoke("plan", &payload).await?;
        planner::parse_plan_response(&raw)
    }
}

/// Evaluation collaborator backed by an external command.
pub struct ProcessEvaluator {
    process: ProcessCollaborator,
}

impl ProcessEvaluator {
    pub fn new(command: &str) -> Result<Self> {
        Ok(Self {
            process: ProcessCollaborator::new(command)?,
        })
    }

    pub fn from_process(process: ProcessCollaborator) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    async fn evaluate(&self, request: &EvalRequest) -> Result<Verdict> {
        let payload = serde_json::to_string(request)?;
        let raw = self.process.invoke("evaluate", &payload).await?;
        evaluator::parse_verdict(&raw)
    }
}

/// Raw judge response document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStallVerdict {
    verdict: String,
    #[serde(default)]
    reason: String,
}

/// Parse and validate a raw stall-judge response.
pub fn parse_stall_verdict(raw: &str) -> Result<StallVerdict> {
    let parsed: RawStallVerdict = serde_json::from_str(raw).map_err(|e| {
        Error::Validation(format!(
            "stall judge response does not match contract ({}): {}",
            e,
            truncate(raw, 200)
        ))
    })?;
    match parsed.verdict.as_str() {
        "hung" => Ok(StallVerdict::Hung {
            reason: parsed.reason,
        }),
        "active" => Ok(StallVerdict::Active),
        other => Err(Error::Validation(format!(
            "unknown stall verdict \"{}\": {}",
            other,
            truncate(raw, 200)
        ))),
    }
}

/// Stall judge backed by an external command.
pub struct ProcessStallJudge {
    process: ProcessCollaborator,
}

impl ProcessStallJudge {
    pub fn new(command: &str) -> Result<Self> {
        Ok(Self {
            process: ProcessCollaborator::new(command)?,
        })
    }

    pub fn from_process(process: ProcessCollaborator) -> Self {
        Self { process }
    }
}

#[async_trait]
impl StallJudge for ProcessStallJudge {
    async fn judge(&self, context: &JudgeContext) -> Result<StallVerdict> {
        let payload = serde_json::to_string(context)?;
        let raw = self.process.invoke("judge", &payload).await?;
        parse_stall_verdict(&raw)
    }
}
