//! Composite task state machine.
//!
//! A composite task runs its sub-tasks strictly in declared order. Status
//! lives in a watch channel so paused sub-tasks can wait for resume without
//! polling; every other piece of run state sits behind one mutex, and status
//! transitions are made while holding it.
//!
//! ```text
//! PENDING ──> RUNNING <──> PAUSED
//!                │
//!                ├──> COMPLETED
//!                ├──> FAILED ─────┐
//!                └──> CANCELLED ──┴──> PENDING (retry)
//! ```

use crate::task::builder::TaskBuilder;
use crate::task::context::{TaskContext, TaskExecutionContext};
use crate::task::error::{ControlError, TaskError};
use crate::task::lock::ResourceLockRegistry;
use crate::task::result::{SubTaskResult, TaskResult};
use crate::task::subtask::{ProgressReporter, SubTask};
use crate::task::types::{SubTaskId, SubTaskProgress, TaskId, TaskProgress, TaskStatus};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked with the final result of every run of a task
pub type TaskCompletionCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// Destination of progress events emitted while a task runs
pub type ProgressSink = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// What a successful resume request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// A paused run continues where it stopped
    Continued,
    /// A failed or cancelled task was reset to pending and must be re-queued
    Restarted,
}

/// Identifies one execution of a task and carries its cancellation token
#[derive(Debug, Clone)]
pub struct RunTicket {
    generation: u64,
    token: CancellationToken,
}

impl RunTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug)]
struct RunState {
    progress: f64,
    // Bumped on every launch and reset; writes from older runs are ignored.
    generation: u64,
    cancel: Option<CancellationToken>,
    current_sub_task: Option<usize>,
    queued: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// A schedulable unit made of ordered sub-tasks
pub struct CompositeTask {
    id: TaskId,
    name: String,
    sub_tasks: Vec<Arc<dyn SubTask>>,
    dependencies: Vec<TaskId>,
    priority: i32,
    on_complete: Option<TaskCompletionCallback>,
    created_at: DateTime<Utc>,
    submission: AtomicU64,
    status: watch::Sender<TaskStatus>,
    state: Mutex<RunState>,
    // Held by the run executing sub-tasks; a restarted run waits for the old one.
    run_lock: Arc<AsyncMutex<()>>,
}

impl fmt::Debug for CompositeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .field("sub_tasks", &self.sub_tasks.len())
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .finish()
    }
}

impl CompositeTask {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        sub_tasks: Vec<Arc<dyn SubTask>>,
        dependencies: Vec<TaskId>,
        priority: i32,
        on_complete: Option<TaskCompletionCallback>,
    ) -> Self {
        let (status, _) = watch::channel(TaskStatus::Pending);
        Self {
            id,
            name,
            sub_tasks,
            dependencies,
            priority,
            on_complete,
            created_at: Utc::now(),
            submission: AtomicU64::new(0),
            status,
            state: Mutex::new(RunState {
                progress: 0.0,
                generation: 0,
                cancel: None,
                current_sub_task: None,
                queued: false,
                started_at: None,
                finished_at: None,
            }),
            run_lock: Arc::default(),
        }
    }

    /// Start building a task with an explicit id
    pub fn builder(id: impl Into<TaskId>, name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(id, name)
    }

    /// Start building a task with a generated UUID id
    pub fn builder_named(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::named(name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sub_tasks(&self) -> &[Arc<dyn SubTask>] {
        &self.sub_tasks
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    /// Informational only; the queue is FIFO
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Position in the order tasks were submitted to a manager
    pub fn submission_index(&self) -> u64 {
        self.submission.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_submitted(&self, index: u64) {
        self.submission.store(index, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().finished_at
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change
    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status.subscribe()
    }

    pub fn progress(&self) -> f64 {
        self.state.lock().progress
    }

    pub fn is_paused(&self) -> bool {
        self.status() == TaskStatus::Paused
    }

    /// Sub-task currently executing (or last executed in a stopped run)
    pub fn current_sub_task(&self) -> Option<&Arc<dyn SubTask>> {
        let index = self.state.lock().current_sub_task?;
        self.sub_tasks.get(index)
    }

    /// Pause support comes from the sub-task that is running right now
    pub fn supports_pause(&self) -> bool {
        self.current_sub_task()
            .is_some_and(|sub_task| sub_task.supports_pause())
    }

    /// Progress snapshot of the task as it stands
    pub fn snapshot(&self, message: impl Into<String>) -> TaskProgress {
        TaskProgress::new(&self.id, self.status(), self.progress(), message)
    }

    /// Cancel the task. Status flips to CANCELLED immediately; the running
    /// sub-task notices at its next checkpoint.
    pub fn cancel(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let status = self.status();
        match status {
            TaskStatus::Cancelled => return Ok(()),
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(self.invalid(status, "cancel"));
            }
            _ => {}
        }

        self.status.send_replace(TaskStatus::Cancelled);
        if let Some(token) = &state.cancel {
            token.cancel();
        }
        state.finished_at = Some(Utc::now());
        debug!("Task {} cancelled (was {})", self.id, status);
        Ok(())
    }

    /// Pause the task. Only allowed while running or pending, and only when
    /// the current sub-task supports pause.
    pub fn pause(&self) -> Result<(), ControlError> {
        let state = self.state.lock();
        let status = self.status();
        if !status.is_normal() {
            return Err(self.invalid(status, "pause"));
        }

        let supported = state
            .current_sub_task
            .and_then(|index| self.sub_tasks.get(index))
            .is_some_and(|sub_task| sub_task.supports_pause());
        if !supported {
            return Err(ControlError::PauseUnsupported(self.id.clone()));
        }

        self.status.send_replace(TaskStatus::Paused);
        debug!("Task {} paused", self.id);
        Ok(())
    }

    /// Resume a paused task, or reset a failed/cancelled one to pending
    pub fn resume(&self) -> Result<Resumption, ControlError> {
        let mut state = self.state.lock();
        match self.status() {
            TaskStatus::Paused => {
                self.status.send_replace(TaskStatus::Running);
                debug!("Task {} resumed", self.id);
                Ok(Resumption::Continued)
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.reset(&mut state);
                Ok(Resumption::Restarted)
            }
            status => Err(self.invalid(status, "resume")),
        }
    }

    /// Reset a failed or cancelled task to pending with zero progress
    pub fn retry(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let status = self.status();
        if !status.is_retryable() {
            return Err(self.invalid(status, "retry"));
        }
        self.reset(&mut state);
        Ok(())
    }

    fn reset(&self, state: &mut RunState) {
        state.generation += 1;
        state.progress = 0.0;
        state.cancel = None;
        state.current_sub_task = None;
        state.started_at = None;
        state.finished_at = None;
        self.status.send_replace(TaskStatus::Pending);
        debug!("Task {} reset to pending", self.id);
    }

    fn invalid(&self, status: TaskStatus, action: &'static str) -> ControlError {
        ControlError::InvalidTransition {
            id: self.id.clone(),
            status,
            action,
        }
    }

    pub(crate) fn completion_callback(&self) -> Option<&TaskCompletionCallback> {
        self.on_complete.as_ref()
    }

    /// Mark the task as sitting in the queue. Returns false if it already was.
    pub(crate) fn mark_queued(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.queued, true)
    }

    pub(crate) fn clear_queued(&self) {
        self.state.lock().queued = false;
    }

    /// Attach the cancellation token of a new run
    pub(crate) fn attach_run(&self, token: CancellationToken) -> RunTicket {
        let mut state = self.state.lock();
        state.generation += 1;
        state.cancel = Some(token.clone());
        RunTicket {
            generation: state.generation,
            token,
        }
    }

    /// Wait until no earlier run of this task is still unwinding
    pub(crate) async fn exclusive_run(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.run_lock).lock_owned().await
    }

    pub(crate) fn is_current_run(&self, ticket: &RunTicket) -> bool {
        self.state.lock().generation == ticket.generation
    }

    /// Run `f` while `ticket` is guaranteed to stay the current run.
    /// Returns false without calling `f` if the run was superseded.
    pub(crate) fn if_current_run(&self, ticket: &RunTicket, f: impl FnOnce()) -> bool {
        let state = self.state.lock();
        if state.generation != ticket.generation {
            return false;
        }
        f();
        true
    }

    /// Detach every run so nothing in flight can write state any more
    pub(crate) fn retire(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
    }

    pub(crate) async fn wait_while_paused(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let mut status = self.status.subscribe();
        debug!("Task {} waiting for resume", self.id);

        let resumed = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            changed = status.wait_for(|s| *s != TaskStatus::Paused) => {
                changed.map(|s| *s != TaskStatus::Cancelled).unwrap_or(false)
            }
        };

        if resumed {
            Ok(())
        } else {
            Err(TaskError::Cancelled)
        }
    }

    fn begin_run(&self, ticket: &RunTicket) -> bool {
        let mut state = self.state.lock();
        if state.generation != ticket.generation {
            return false;
        }

        let status = self.status();
        if status.is_terminal() {
            return false;
        }
        if ticket.token.is_cancelled() {
            self.status.send_replace(TaskStatus::Cancelled);
            return false;
        }

        if status == TaskStatus::Pending {
            self.status.send_replace(TaskStatus::Running);
        }
        state.current_sub_task = None;
        state.started_at = Some(Utc::now());
        state.finished_at = None;
        true
    }

    fn set_current(&self, ticket: &RunTicket, index: usize) {
        let mut state = self.state.lock();
        if state.generation == ticket.generation {
            state.current_sub_task = Some(index);
        }
    }

    fn is_run_cancelled(&self, ticket: &RunTicket) -> bool {
        ticket.token.is_cancelled() || self.status() == TaskStatus::Cancelled
    }

    /// Fold a sub-task progress report into the task progress. Returns `None`
    /// when the report must be suppressed.
    fn advance_progress(
        &self,
        ticket: &RunTicket,
        index: usize,
        total: usize,
        sub_progress: f64,
    ) -> Option<f64> {
        let mut state = self.state.lock();
        if state.generation != ticket.generation || ticket.token.is_cancelled() {
            return None;
        }
        if matches!(self.status(), TaskStatus::Paused | TaskStatus::Cancelled) {
            return None;
        }

        // Over-reports are capped at the sub-task's share so task progress stays within 0..=1.
        let candidate = (index as f64 + sub_progress.clamp(0.0, 1.0)) / total as f64;
        state.progress = state.progress.max(candidate);
        Some(state.progress)
    }

    /// Move the task to its final status. A cancellation that landed first
    /// wins. Returns `None` when the run is stale.
    fn finish(&self, ticket: &RunTicket, target: TaskStatus) -> Option<TaskStatus> {
        let mut state = self.state.lock();
        if state.generation != ticket.generation {
            return None;
        }

        let status = if self.status() == TaskStatus::Cancelled {
            TaskStatus::Cancelled
        } else {
            self.status.send_replace(target);
            target
        };

        if status == TaskStatus::Completed {
            state.progress = 1.0;
        }
        state.current_sub_task = None;
        state.finished_at = Some(Utc::now());
        Some(status)
    }

    fn progress_reporter(
        self: &Arc<Self>,
        ticket: &RunTicket,
        index: usize,
        total: usize,
        sub_task: &dyn SubTask,
        progresses: &Arc<Mutex<IndexMap<SubTaskId, SubTaskProgress>>>,
        sink: &ProgressSink,
    ) -> ProgressReporter {
        let task = Arc::clone(self);
        let ticket = ticket.clone();
        let progresses = Arc::clone(progresses);
        let sink = Arc::clone(sink);
        let message = format!("running sub-task: {}", sub_task.name());

        ProgressReporter::new(
            &self.id,
            sub_task.id(),
            sub_task.name(),
            Arc::new(move |update: SubTaskProgress| {
                let Some(progress) = task.advance_progress(&ticket, index, total, update.progress)
                else {
                    return;
                };

                let snapshot = {
                    let mut map = progresses.lock();
                    map.insert(update.sub_task_id.clone(), update);
                    map.clone()
                };

                sink(
                    TaskProgress::new(task.id(), TaskStatus::Running, progress, message.as_str())
                        .with_sub_tasks(snapshot),
                );
            }),
        )
    }

    async fn run_sub_task(
        &self,
        sub_task: &dyn SubTask,
        context: &TaskExecutionContext,
        reporter: &ProgressReporter,
        locks: &ResourceLockRegistry,
        cancel: &CancellationToken,
    ) -> Result<SubTaskResult, TaskError> {
        let guarded = async {
            // Held until the sub-task returns or is dropped.
            let _permit = match sub_task.resource_lock() {
                Some(lock) => {
                    debug!(
                        "Task {} waiting for resource '{}' ({})",
                        self.id,
                        lock.key,
                        sub_task.id()
                    );
                    Some(locks.acquire_permit(lock, cancel).await?)
                }
                None => None,
            };
            sub_task.execute(context, reporter).await
        };

        // A cancelled sub-task is dropped at its next await point.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
            outcome = AssertUnwindSafe(guarded).catch_unwind() => outcome,
        };

        outcome.unwrap_or_else(|panic| {
            Err(TaskError::Failed(format!(
                "sub-task '{}' panicked: {}",
                sub_task.id(),
                panic_message(panic.as_ref())
            )))
        })
    }

    /// Drive one run of the task to a final result.
    ///
    /// Sub-tasks run in order; the first failure fails the task. Every result
    /// collected before the run stopped is kept in the returned [`TaskResult`].
    pub(crate) async fn execute(
        self: &Arc<Self>,
        ticket: &RunTicket,
        context: &Arc<TaskContext>,
        locks: &ResourceLockRegistry,
        sink: &ProgressSink,
    ) -> TaskResult {
        let mut results: IndexMap<SubTaskId, SubTaskResult> = IndexMap::new();
        let progresses: Arc<Mutex<IndexMap<SubTaskId, SubTaskProgress>>> = Arc::default();

        if !self.begin_run(ticket) {
            debug!("Task {} not started: cancelled or superseded", self.id);
            return TaskResult::cancelled(results);
        }

        info!(
            "Starting task {} '{}' with {} sub-tasks",
            self.id,
            self.name,
            self.sub_tasks.len()
        );
        sink(TaskProgress::new(
            &self.id,
            TaskStatus::Running,
            self.progress(),
            "task started",
        ));

        let total = self.sub_tasks.len();
        for (index, sub_task) in self.sub_tasks.iter().enumerate() {
            self.set_current(ticket, index);

            if self.is_run_cancelled(ticket) {
                return self.conclude(ticket, TaskStatus::Cancelled, None, results, &progresses, sink);
            }

            if self.is_paused() && self.wait_while_paused(&ticket.token).await.is_err() {
                return self.conclude(ticket, TaskStatus::Cancelled, None, results, &progresses, sink);
            }

            let execution_context = TaskExecutionContext::new(
                Arc::clone(context),
                Arc::clone(self),
                ticket.token.clone(),
                results.clone(),
            );
            let reporter =
                self.progress_reporter(ticket, index, total, sub_task.as_ref(), &progresses, sink);

            let started = Instant::now();
            let outcome = self
                .run_sub_task(
                    sub_task.as_ref(),
                    &execution_context,
                    &reporter,
                    locks,
                    &ticket.token,
                )
                .await;

            match outcome {
                Ok(mut result) => {
                    result.execution_time = started.elapsed();
                    if std::panic::catch_unwind(AssertUnwindSafe(|| sub_task.on_complete(&result)))
                        .is_err()
                    {
                        warn!(
                            "Completion callback of sub-task {} in task {} panicked",
                            sub_task.id(),
                            self.id
                        );
                    }

                    let success = result.success;
                    let error = result.error.clone();
                    results.insert(sub_task.id().to_string(), result);

                    if !success {
                        progresses.lock().insert(
                            sub_task.id().to_string(),
                            SubTaskProgress {
                                task_id: self.id.clone(),
                                sub_task_id: sub_task.id().to_string(),
                                sub_task_name: sub_task.name().to_string(),
                                status: TaskStatus::Failed,
                                progress: 0.0,
                                message: error.clone().unwrap_or_default(),
                            },
                        );
                        warn!(
                            "Task {} failed at sub-task {}: {}",
                            self.id,
                            sub_task.id(),
                            error.as_deref().unwrap_or("no error message")
                        );
                        return self.conclude(
                            ticket,
                            TaskStatus::Failed,
                            error,
                            results,
                            &progresses,
                            sink,
                        );
                    }
                }
                Err(TaskError::Cancelled) => {
                    return self.conclude(ticket, TaskStatus::Cancelled, None, results, &progresses, sink);
                }
                Err(error) => {
                    warn!(
                        "Task {} raised an error in sub-task {}: {}",
                        self.id,
                        sub_task.id(),
                        error
                    );
                    return self.conclude(
                        ticket,
                        TaskStatus::Failed,
                        Some(error.to_string()),
                        results,
                        &progresses,
                        sink,
                    );
                }
            }
        }

        if self.is_run_cancelled(ticket) {
            return self.conclude(ticket, TaskStatus::Cancelled, None, results, &progresses, sink);
        }
        self.conclude(ticket, TaskStatus::Completed, None, results, &progresses, sink)
    }

    fn conclude(
        &self,
        ticket: &RunTicket,
        target: TaskStatus,
        error: Option<String>,
        results: IndexMap<SubTaskId, SubTaskResult>,
        progresses: &Mutex<IndexMap<SubTaskId, SubTaskProgress>>,
        sink: &ProgressSink,
    ) -> TaskResult {
        let Some(status) = self.finish(ticket, target) else {
            debug!("Discarding outcome of superseded run of task {}", self.id);
            return TaskResult::cancelled(results);
        };

        let snapshot = progresses.lock().clone();
        let progress = self.progress();

        match status {
            TaskStatus::Completed => {
                info!("Task {} completed", self.id);
                sink(
                    TaskProgress::new(&self.id, status, progress, "task completed")
                        .with_sub_tasks(snapshot),
                );
                TaskResult::completed(results)
            }
            TaskStatus::Failed => {
                let message = format!(
                    "task failed: {}",
                    error.as_deref().unwrap_or("unknown error")
                );
                sink(TaskProgress::new(&self.id, status, progress, message).with_sub_tasks(snapshot));
                TaskResult::failed(error, results)
            }
            _ => {
                info!("Task {} cancelled", self.id);
                sink(
                    TaskProgress::new(&self.id, TaskStatus::Cancelled, progress, "task cancelled")
                        .with_sub_tasks(snapshot),
                );
                TaskResult::cancelled(results)
            }
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
