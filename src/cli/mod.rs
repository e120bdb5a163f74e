//! CLI-specific functionality for taskweave
//!
//! This module contains all CLI-related code including argument parsing,
//! configuration discovery and the simulated workload behind `run`.

pub mod args;
pub mod config;
pub mod demo;

pub use args::{Args, ExecutionMode, RunConfig};
pub use config::{CliConfig, ConfigDiscovery, ConfigError};
