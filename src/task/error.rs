use crate::task::types::{TaskId, TaskStatus};
use thiserror::Error;

/// Errors a sub-task can raise out of `execute`.
///
/// Logical failures should be reported as `Ok(SubTaskResult::failure(..))`;
/// an `Err` here means the run was cancelled or something unexpected happened.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error("resource lock '{key}' unavailable: {reason}")]
    ResourceLock { key: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Rejected control requests against the task manager
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("task '{0}' not found")]
    NotFound(TaskId),
    #[error("task '{0}' does not support pause in its current sub-task")]
    PauseUnsupported(TaskId),
    #[error("cannot {action} task '{id}' while it is {status}")]
    InvalidTransition {
        id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },
    #[error("task manager has been shut down")]
    ShutDown,
}

/// Validation errors raised when building tasks and sub-tasks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("task id must not be empty")]
    EmptyId,
    #[error("sub-task id must not be empty (task '{0}')")]
    EmptySubTaskId(TaskId),
    #[error("duplicate sub-task id '{sub_task_id}' in task '{task_id}'")]
    DuplicateSubTask {
        task_id: TaskId,
        sub_task_id: String,
    },
    #[error("task '{0}' cannot depend on itself")]
    SelfDependency(TaskId),
    #[error("resource lock '{0}' needs at least one permit")]
    ZeroPermits(String),
    #[error("resource lock '{key}' asks for {permits} permits, more than the maximum of {max}")]
    TooManyPermits {
        key: String,
        permits: usize,
        max: usize,
    },
    #[error("sub-task '{0}' has no handler")]
    MissingHandler(String),
}
