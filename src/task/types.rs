use crate::task::result::{SubTaskResult, TaskResult};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for composite tasks
pub type TaskId = String;

/// Identifier for sub-tasks, unique within their composite task
pub type SubTaskId = String;

/// Lifecycle state shared by composite tasks and sub-task progress snapshots
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is registered and waiting in the queue
    Pending,
    /// Task is currently executing its sub-tasks
    Running,
    /// Task was paused by a caller and waits for resume
    Paused,
    /// Every sub-task finished successfully
    Completed,
    /// A sub-task failed or execution raised an error
    Failed,
    /// Task was cancelled; can still be retried
    Cancelled,
}

impl TaskStatus {
    /// Check if the status is terminal (no further execution without retry)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check if a task in this status may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Pending or running; the "normal" in-flight states
    pub fn is_normal(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters over every task in the manager's task table.
///
/// The six status counters always sum to `total`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStatistics {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    pub total: usize,
}

impl TaskStatistics {
    /// Build statistics by counting a sequence of statuses
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut stats = TaskStatistics::default();
        for status in statuses {
            stats.record(status);
        }
        stats
    }

    fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    /// Tasks that have not finished yet (pending, running or paused)
    pub fn active(&self) -> usize {
        self.pending + self.running + self.paused
    }

    /// Tasks that reached a terminal state
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Check the counter invariant
    pub fn is_consistent(&self) -> bool {
        self.active() + self.finished() == self.total
    }
}

/// Point-in-time progress of one sub-task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SubTaskProgress {
    pub task_id: TaskId,
    pub sub_task_id: SubTaskId,
    pub sub_task_name: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
}

/// Point-in-time progress of a composite task, emitted as an event
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
    pub sub_task_progresses: IndexMap<SubTaskId, SubTaskProgress>,
    pub timestamp: DateTime<Utc>,
}

impl TaskProgress {
    pub fn new(
        task_id: impl Into<TaskId>,
        status: TaskStatus,
        progress: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            progress,
            message: message.into(),
            sub_task_progresses: IndexMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_sub_tasks(mut self, progresses: IndexMap<SubTaskId, SubTaskProgress>) -> Self {
        self.sub_task_progresses = progresses;
        self
    }
}

/// Completion notice delivered in batches to batch-completion listeners
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskCompletionInfo {
    pub task_id: TaskId,
    pub task_name: String,
    pub success: bool,
    pub status: TaskStatus,
    pub sub_task_results: IndexMap<SubTaskId, SubTaskResult>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskCompletionInfo {
    pub fn from_result(task_id: &str, task_name: &str, result: &TaskResult) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            success: result.success,
            status: result.status,
            sub_task_results: result.sub_task_results.clone(),
            error: result.error.clone(),
            completed_at: Utc::now(),
        }
    }

    pub fn successful_sub_task_count(&self) -> usize {
        self.sub_task_results.values().filter(|r| r.success).count()
    }

    pub fn failed_sub_task_count(&self) -> usize {
        self.sub_task_results.values().filter(|r| !r.success).count()
    }

    pub fn all_sub_tasks_successful(&self) -> bool {
        self.sub_task_results.values().all(|r| r.success)
    }

    pub fn failed_sub_task_ids(&self) -> Vec<SubTaskId> {
        self.sub_task_results
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
