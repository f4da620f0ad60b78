use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use foreman::config::Config;
use foreman::core::task::TaskStatus;
use foreman::orchestration::{
    ProcessEvaluator, ProcessPlanner, ProcessRunner, ProcessStallJudge, SprintConfig, SprintLoop,
    SprintOutcome,
};
use foreman::state::RunState;
use foreman::{flog, Result};

/// Foreman - supervised execution of task graphs by external workers
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Plan and execute a goal until it is achieved or the budget runs out
    Run {
        /// The goal in natural language
        goal: String,

        /// Additional context passed to the planner
        #[arg(long, default_value = "")]
        context: String,

        /// Maximum concurrently running workers
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Iteration budget (0 = run until success)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Explicit per-task kill timeout in seconds, overriding
        /// complexity tiers
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Resume an interrupted run from its snapshot
    Resume {
        /// Snapshot file (defaults to the configured state directory)
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Print the status of the current run snapshot
    Status {
        /// Snapshot file (defaults to the configured state directory)
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    foreman::log::init_with_debug(cli.debug);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;

    match cli.command {
        Command::Run {
            goal,
            context,
            max_parallel,
            max_iterations,
            timeout_secs,
        } => {
            let mut sprint_config = sprint_config_from(&config)?;
            if let Some(n) = max_parallel {
                sprint_config.max_parallel = n;
            }
            if let Some(n) = max_iterations {
                sprint_config.max_iterations = if n == 0 { None } else { Some(n) };
            }
            if let Some(secs) = timeout_secs {
                sprint_config.timeout_override = Some(Duration::from_secs(secs));
            }

            let sprint = build_sprint(&config, sprint_config)?;
            let cancel = cancel_on_ctrl_c();
            flog!("starting run: {}", goal);
            let outcome = sprint.run(&goal, &context, cancel).await?;
            report(&outcome);
            Ok(())
        }
        Command::Resume { state } => {
            let mut sprint_config = sprint_config_from(&config)?;
            if let Some(path) = state {
                sprint_config.snapshot_path = path;
            }
            let sprint = build_sprint(&config, sprint_config)?;
            let cancel = cancel_on_ctrl_c();
            let outcome = sprint.resume(cancel).await?;
            report(&outcome);
            Ok(())
        }
        Command::Status { state } => {
            let path = match state {
                Some(path) => path,
                None => config.state_dir()?.join("run_state.json"),
            };
            let contents = std::fs::read_to_string(&path)?;
            let run_state: RunState = serde_json::from_str(&contents)?;
            println!("{}", run_state.summary());
            Ok(())
        }
    }
}

fn sprint_config_from(config: &Config) -> Result<SprintConfig> {
    let mut sprint_config = SprintConfig::new(config.state_dir()?.join("run_state.json"));
    sprint_config.max_parallel = config.effective_max_parallel();
    if let Some(n) = config.max_iterations {
        sprint_config.max_iterations = if n == 0 { None } else { Some(n) };
    }
    sprint_config.retry_limit = config.effective_retry_limit();
    sprint_config.timeout_override = config.task_timeout();
    sprint_config.reaper = config.reaper_config();
    Ok(sprint_config)
}

fn build_sprint(config: &Config, sprint_config: SprintConfig) -> Result<SprintLoop> {
    let planner = Arc::new(ProcessPlanner::new(config.effective_planner_command())?);
    let evaluator = Arc::new(ProcessEvaluator::new(config.effective_evaluator_command())?);
    let judge = Arc::new(ProcessStallJudge::new(config.effective_judge_command())?);
    let runner = Arc::new(
        ProcessRunner::new(config.effective_worker_command())?
            .with_kill_grace(sprint_config.reaper.kill_grace),
    );
    Ok(SprintLoop::new(
        sprint_config,
        planner,
        evaluator,
        judge,
        runner,
    ))
}

/// Cancellation token wired to Ctrl-C: one press cancels the run (workers
/// are killed before control returns).
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling run, terminating workers...");
            trigger.cancel();
        }
    });
    cancel
}

fn report(outcome: &SprintOutcome) {
    match outcome {
        SprintOutcome::Succeeded {
            state,
            reasoning,
            iterations,
        } => {
            println!(
                "Goal achieved after {} iteration(s): {}",
                iterations, reasoning
            );
            print_state(state);
        }
        SprintOutcome::Exhausted {
            state,
            reason,
            iterations,
        } => {
            println!("Run ended after {} iteration(s): {}", iterations, reason);
            print_state(state);
        }
        SprintOutcome::PlanningFailed { state, error } => {
            println!("Planning failed: {}", error);
            if let Some(state) = state {
                print_state(state);
            }
        }
    }
}

fn print_state(state: &RunState) {
    let completed = state
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    println!(
        "{}/{} tasks completed ({} blocked)",
        completed,
        state.tasks.len(),
        state.blocked_count()
    );
    println!();
    println!("{}", state.summary());
}
