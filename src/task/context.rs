use crate::task::composite::CompositeTask;
use crate::task::error::TaskError;
use crate::task::result::{FromPayload, SubTaskResult, TaskResult};
use crate::task::types::{SubTaskId, TaskId, TaskStatus};
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Global result store shared by every task of a manager.
///
/// Dependency gating looks results up here: a dependency is satisfied once
/// its task id maps to a result with `success == true`.
#[derive(Debug, Default)]
pub struct TaskContext {
    results: DashMap<TaskId, TaskResult>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the result of a finished task, replacing any previous one
    pub fn record(&self, task_id: impl Into<TaskId>, result: TaskResult) {
        self.results.insert(task_id.into(), result);
    }

    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.results.get(task_id).map(|r| r.value().clone())
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskResult> {
        self.results.remove(task_id).map(|(_, result)| result)
    }

    /// Check whether `task_id` has a recorded successful result
    pub fn is_satisfied(&self, task_id: &str) -> bool {
        self.results.get(task_id).is_some_and(|r| r.success)
    }

    pub fn dependencies_satisfied(&self, dependencies: &[TaskId]) -> bool {
        dependencies.iter().all(|id| self.is_satisfied(id))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn clear(&self) {
        self.results.clear();
    }
}

/// Context handed to each sub-task invocation.
///
/// Carries the global result store, the owning composite task and the
/// results of the sub-tasks that ran before this one. The pause and
/// cancellation helpers are the cooperative checkpoints sub-tasks are
/// expected to hit while they work.
#[derive(Clone)]
pub struct TaskExecutionContext {
    task_context: Arc<TaskContext>,
    task: Arc<CompositeTask>,
    cancel: CancellationToken,
    previous_results: Arc<IndexMap<SubTaskId, SubTaskResult>>,
}

impl TaskExecutionContext {
    pub fn new(
        task_context: Arc<TaskContext>,
        task: Arc<CompositeTask>,
        cancel: CancellationToken,
        previous_results: IndexMap<SubTaskId, SubTaskResult>,
    ) -> Self {
        Self {
            task_context,
            task,
            cancel,
            previous_results: Arc::new(previous_results),
        }
    }

    pub fn task_context(&self) -> &Arc<TaskContext> {
        &self.task_context
    }

    pub fn task(&self) -> &Arc<CompositeTask> {
        &self.task
    }

    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    /// Token cancelled when the owning run is cancelled; useful in `select!`
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.task.status() == TaskStatus::Cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.task.is_paused()
    }

    /// Paused and not cancelled
    pub fn check_pause(&self) -> bool {
        self.is_paused() && !self.is_cancelled()
    }

    /// Paused or cancelled; the sub-task should stop making progress
    pub fn should_stop(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }

    /// Wait while the task is paused, then fail with
    /// [`TaskError::Cancelled`] if the run was cancelled.
    pub async fn check_pause_and_wait(&self) -> Result<(), TaskError> {
        if self.check_pause() {
            self.task.wait_while_paused(&self.cancel).await?;
        }

        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    pub fn previous_results(&self) -> &IndexMap<SubTaskId, SubTaskResult> {
        &self.previous_results
    }

    pub fn previous_result(&self, sub_task_id: &str) -> Option<&SubTaskResult> {
        self.previous_results.get(sub_task_id)
    }

    pub fn previous_result_as<T: FromPayload>(&self, sub_task_id: &str) -> Option<T> {
        self.previous_result(sub_task_id)
            .and_then(|r| r.data_as::<T>())
    }

    /// Payload of the most recent sub-task, if it has one of type `T`
    pub fn last_result_as<T: FromPayload>(&self) -> Option<T> {
        self.previous_results
            .values()
            .last()
            .and_then(|r| r.data_as::<T>())
    }

    /// First successful payload of type `T`
    pub fn first_result_of<T: FromPayload>(&self) -> Option<T> {
        self.previous_results
            .values()
            .find(|r| r.success && r.has_data_of::<T>())
            .and_then(|r| r.data_as::<T>())
    }

    /// Every successful payload of type `T`, in execution order
    pub fn all_results_of<T: FromPayload>(&self) -> Vec<T> {
        self.previous_results
            .values()
            .filter(|r| r.success)
            .filter_map(|r| r.data_as::<T>())
            .collect()
    }

    /// Result recorded for another composite task, e.g. a dependency
    pub fn dependency_result(&self, task_id: &str) -> Option<TaskResult> {
        self.task_context.result(task_id)
    }
}
