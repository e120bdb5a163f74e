//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `run`: Execute a simulated workload on a task manager
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a default configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::Semaphore;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig,
    InitConfig { dir: Option<PathBuf> },
}

/// Shape of the simulated workload executed by `run`
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub tasks: usize,
    pub sub_tasks: usize,
    pub fail_rate: f64,
    pub permits: usize,
    pub step_ms: u64,
    pub chain: bool,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "taskweave")]
#[command(author = "Taskweave Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Concurrent, dependency-aware composite task execution engine")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a simulated workload and log the batched notifications
    Run {
        /// Number of composite tasks
        #[arg(short = 't', long = "tasks", default_value_t = 5)]
        tasks: usize,
        /// Sub-tasks per composite task
        #[arg(short = 's', long = "subtasks", default_value_t = 3)]
        sub_tasks: usize,
        /// Probability (0.0 to 1.0) that a sub-task fails
        #[arg(short = 'f', long = "fail-rate", default_value_t = 0.0)]
        fail_rate: f64,
        /// Permits of the shared resource every sub-task locks
        #[arg(short = 'p', long = "permits", default_value_t = 2)]
        permits: usize,
        /// Simulated duration of one sub-task step in milliseconds
        #[arg(long = "step-ms", default_value_t = 50)]
        step_ms: u64,
        /// Make every task depend on the one before it
        #[arg(long = "chain")]
        chain: bool,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Write a default configuration file
    InitConfig {
        /// Directory to write config.toml into (defaults to ~/.taskweave)
        #[arg(long = "dir")]
        dir: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                tasks,
                sub_tasks,
                fail_rate,
                permits,
                step_ms,
                chain,
                config,
                verbose,
            }) => {
                if *tasks == 0 || *sub_tasks == 0 {
                    return Err("--tasks and --subtasks must be at least 1".to_string());
                }
                if !(0.0..=1.0).contains(fail_rate) {
                    return Err(format!("--fail-rate must be within 0.0..=1.0, got {}", fail_rate));
                }
                if *permits == 0 || *permits > Semaphore::MAX_PERMITS {
                    return Err(format!(
                        "--permits must be within 1..={}, got {}",
                        Semaphore::MAX_PERMITS,
                        permits
                    ));
                }

                Ok(ExecutionMode::Run(RunConfig {
                    tasks: *tasks,
                    sub_tasks: *sub_tasks,
                    fail_rate: *fail_rate,
                    permits: *permits,
                    step_ms: *step_ms,
                    chain: *chain,
                    config_override: config.clone(),
                    verbose: *verbose,
                }))
            }
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            Some(Commands::InitConfig { dir }) => Ok(ExecutionMode::InitConfig { dir: dir.clone() }),
            None => Err(
                "No command specified. Use 'taskweave --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}
