use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::ReaperConfig;
use crate::{flog_debug, Error, Result};

/// Default maximum number of concurrently running workers.
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// Default iteration budget for the outer sprint loop.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Default number of failed attempts before a task is permanently failed.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Command used to run a task worker process.
    pub worker_command: Option<String>,
    /// Command used for the planning collaborator.
    pub planner_command: Option<String>,
    /// Command used for the evaluation collaborator.
    pub evaluator_command: Option<String>,
    /// Command used for the stall-judgment collaborator.
    pub judge_command: Option<String>,
    /// Maximum number of concurrently running workers.
    pub max_parallel: Option<usize>,
    /// Iteration budget for the outer loop (absent = default).
    pub max_iterations: Option<u32>,
    /// Failed attempts allowed before a task is permanently failed.
    pub retry_limit: Option<u32>,
    /// Explicit kill timeout in seconds, overriding complexity tiers.
    pub task_timeout_secs: Option<u64>,
    /// Whether workers are expected to emit periodic heartbeat markers.
    #[serde(default)]
    pub expect_heartbeat: bool,
    /// Directory for run-state snapshots (absent = ~/.foreman/state).
    pub state_dir: Option<String>,
    /// Reaper tuning overrides.
    #[serde(default)]
    pub reaper: ReaperOverrides,
}

/// Optional overrides for the reaper's timing thresholds.
///
/// Anything left unset falls back to `ReaperConfig::default()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReaperOverrides {
    pub poll_interval_secs: Option<u64>,
    pub startup_grace_secs: Option<u64>,
    pub silence_timeout_secs: Option<u64>,
    pub hard_silence_secs: Option<u64>,
    pub kill_grace_secs: Option<u64>,
    pub loop_threshold: Option<usize>,
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("state")),
        }
    }

    pub fn effective_worker_command(&self) -> &str {
        self.worker_command.as_deref().unwrap_or("claude")
    }

    pub fn effective_planner_command(&self) -> &str {
        self.planner_command
            .as_deref()
            .or(self.worker_command.as_deref())
            .unwrap_or("claude")
    }

    pub fn effective_evaluator_command(&self) -> &str {
        self.evaluator_command
            .as_deref()
            .or(self.worker_command.as_deref())
            .unwrap_or("claude")
    }

    pub fn effective_judge_command(&self) -> &str {
        self.judge_command
            .as_deref()
            .or(self.worker_command.as_deref())
            .unwrap_or("claude")
    }

    pub fn effective_max_parallel(&self) -> usize {
        self.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL)
    }

    pub fn effective_retry_limit(&self) -> u32 {
        self.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Build the reaper configuration from defaults plus overrides.
    pub fn reaper_config(&self) -> ReaperConfig {
        let mut cfg = ReaperConfig::default();
        cfg.expect_heartbeat = self.expect_heartbeat;
        if let Some(secs) = self.reaper.poll_interval_secs {
            cfg.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reaper.startup_grace_secs {
            cfg.startup_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reaper.silence_timeout_secs {
            cfg.silence_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reaper.hard_silence_secs {
            cfg.hard_silence = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reaper.kill_grace_secs {
            cfg.kill_grace = Duration::from_secs(secs);
        }
        if let Some(n) = self.reaper.loop_threshold {
            cfg.loop_threshold = n;
        }
        cfg
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        flog_debug!(
            "Config loaded: worker_command={:?}, max_parallel={:?}, retry_limit={:?}",
            config.worker_command,
            config.max_parallel,
            config.retry_limit
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        flog_debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        let state_dir = self.state_dir()?;
        if !dir.exists() {
            flog_debug!("Creating foreman directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        if !state_dir.exists() {
            flog_debug!("Creating state directory: {}", state_dir.display());
            fs::create_dir_all(&state_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
