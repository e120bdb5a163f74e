//! Environment constants and path utilities for taskweave.
//!
//! Centralizes the directory, file and variable names used by configuration
//! discovery and the CLI.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const TASKWEAVE_DIR_NAME: &str = ".taskweave";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name when placed directly in a project directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "taskweave.toml";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "TASKWEAVE_CONFIG";

/// Log filter used when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "taskweave=info";

/// Log filter used with `--verbose`
pub const VERBOSE_LOG_FILTER: &str = "taskweave=debug";

/// Build the application directory path from a base directory
pub fn taskweave_dir_path(base: &Path) -> PathBuf {
    base.join(TASKWEAVE_DIR_NAME)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    taskweave_dir_path(home_dir)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build the `taskweave.toml` path in a project directory
pub fn project_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// Build the `.taskweave/config.toml` path in a project directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    taskweave_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

/// Home directory from `HOME`, falling back to `USERPROFILE`
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Explicit config file requested through [`CONFIG_ENV_VAR`]
pub fn config_override() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
