use crate::task::composite::{CompositeTask, Resumption};
use crate::task::context::TaskContext;
use crate::task::error::ControlError;
use crate::task::events::{EventAggregator, ListenerId, TaskTable};
use crate::task::lock::ResourceLockRegistry;
use crate::task::result::TaskResult;
use crate::task::scheduler::{Dispatcher, QueueProcessor, Scheduler};
use crate::task::types::{
    TaskCompletionInfo, TaskId, TaskProgress, TaskStatistics, TaskStatus,
};
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for task manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Period of the batching tick that delivers buffered events
    pub tick_interval_ms: u64,
    /// Fallback delay before parked tasks are re-evaluated
    pub requeue_delay_ms: u64,
    /// Upper bound on concurrently running tasks; unbounded when unset
    pub max_concurrent_tasks: Option<usize>,
    /// Re-evaluate parked tasks as soon as a task finishes, is resumed or retried
    pub event_driven_wakeup: bool,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            requeue_delay_ms: 1000,
            max_concurrent_tasks: None,
            event_driven_wakeup: true,
        }
    }
}

impl TaskManagerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms.max(1))
    }
}

/// Central task management system.
///
/// Owns the task table, result store, resource locks and event aggregator,
/// and runs the queue processor and batching tick on its [`Scheduler`].
/// Failures never escape as errors from submission; they show up as task
/// statuses, results and listener notifications.
pub struct TaskManager {
    config: TaskManagerConfig,
    tasks: Arc<TaskTable>,
    context: Arc<TaskContext>,
    locks: Arc<ResourceLockRegistry>,
    events: Arc<EventAggregator>,
    scheduler: Arc<Scheduler>,
    gate: Arc<Notify>,
    queue: Mutex<Option<mpsc::UnboundedSender<TaskId>>>,
    submissions: AtomicU64,
}

impl TaskManager {
    /// Create a task manager on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(config: TaskManagerConfig) -> Self {
        Self::with_scheduler(config, Arc::new(Scheduler::current()))
    }

    /// Create a task manager whose loops and runs live in `scheduler`
    pub fn with_scheduler(config: TaskManagerConfig, scheduler: Arc<Scheduler>) -> Self {
        let tasks: Arc<TaskTable> = Arc::default();
        let context = Arc::new(TaskContext::new());
        let locks = Arc::new(ResourceLockRegistry::new());
        let events = Arc::new(EventAggregator::new(Arc::clone(&tasks)));
        let gate = Arc::new(Notify::new());
        let slots = config
            .max_concurrent_tasks
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS))));

        let dispatcher = Arc::new(Dispatcher {
            tasks: Arc::clone(&tasks),
            context: Arc::clone(&context),
            locks: Arc::clone(&locks),
            events: Arc::clone(&events),
            scheduler: Arc::clone(&scheduler),
            gate: Arc::clone(&gate),
            slots,
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let processor = QueueProcessor::new(
            receiver,
            dispatcher,
            config.requeue_delay(),
            config.event_driven_wakeup,
        );
        scheduler.spawn(processor.run());
        scheduler.spawn(run_ticker(
            Arc::clone(&events),
            config.tick_interval(),
            scheduler.shutdown_token().clone(),
        ));

        info!(
            "Task manager started (tick {:?}, requeue delay {:?}, max concurrent {:?})",
            config.tick_interval(),
            config.requeue_delay(),
            config.max_concurrent_tasks
        );

        Self {
            config,
            tasks,
            context,
            locks,
            events,
            scheduler,
            gate,
            queue: Mutex::new(Some(sender)),
            submissions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// Register and enqueue one task. Returns false if it was rejected.
    pub fn add_task(&self, task: CompositeTask) -> bool {
        !self.add_tasks([task]).is_empty()
    }

    /// Register and enqueue tasks in order; returns the ids that were accepted.
    ///
    /// Duplicate ids and submissions after shutdown are logged and skipped.
    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = CompositeTask>) -> Vec<TaskId> {
        if self.is_shut_down() {
            warn!("Task manager is shut down; rejecting submitted tasks");
            return Vec::new();
        }

        let mut added = Vec::new();
        for task in tasks {
            let task = Arc::new(task);
            match self.tasks.entry(task.id().to_string()) {
                Entry::Occupied(_) => {
                    warn!("Rejecting task with duplicate id {}", task.id());
                    continue;
                }
                Entry::Vacant(slot) => {
                    task.mark_submitted(self.submissions.fetch_add(1, Ordering::Relaxed));
                    slot.insert(Arc::clone(&task));
                }
            }
            self.enqueue(&task);
            added.push(task);
        }

        if added.is_empty() {
            return Vec::new();
        }

        info!("Added {} tasks", added.len());
        self.events.notify_task_added(&added);
        self.events.refresh_statistics();
        added.iter().map(|task| task.id().to_string()).collect()
    }

    fn enqueue(&self, task: &CompositeTask) -> bool {
        if !task.mark_queued() {
            debug!("Task {} is already queued", task.id());
            return false;
        }

        let sent = self
            .queue
            .lock()
            .as_ref()
            .is_some_and(|queue| queue.send(task.id().to_string()).is_ok());
        if !sent {
            task.clear_queued();
            warn!("Could not enqueue task {}: queue closed", task.id());
        }
        sent
    }

    fn find(&self, id: &str) -> Result<Arc<CompositeTask>, ControlError> {
        self.tasks
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    fn ensure_open(&self) -> Result<(), ControlError> {
        if self.is_shut_down() {
            Err(ControlError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub fn pause_task(&self, id: &str) -> Result<(), ControlError> {
        let task = self.find(id)?;
        task.pause()
            .inspect_err(|e| warn!("Pause rejected: {}", e))?;

        info!("Paused task {}", id);
        self.events.push_progress(task.snapshot("task paused"));
        Ok(())
    }

    /// Resume a paused task, or restart a failed/cancelled one
    pub fn resume_task(&self, id: &str) -> Result<(), ControlError> {
        let task = self.find(id)?;
        if task.status().is_retryable() {
            self.ensure_open()?;
        }

        match task
            .resume()
            .inspect_err(|e| warn!("Resume rejected: {}", e))?
        {
            Resumption::Continued => {
                info!("Resumed task {}", id);
                self.events.push_progress(task.snapshot("task resumed"));
            }
            Resumption::Restarted => self.restart(&task),
        }

        self.gate.notify_one();
        Ok(())
    }

    /// Reset a failed or cancelled task to pending and enqueue it again
    pub fn retry_task(&self, id: &str) -> Result<(), ControlError> {
        let task = self.find(id)?;
        self.ensure_open()?;
        task.retry()
            .inspect_err(|e| warn!("Retry rejected: {}", e))?;

        self.restart(&task);
        self.gate.notify_one();
        Ok(())
    }

    fn restart(&self, task: &CompositeTask) {
        self.context.remove(task.id());
        self.enqueue(task);
        info!("Restarting task {}", task.id());
        self.events.push_progress(task.snapshot("task restarted"));
    }

    pub fn cancel_task(&self, id: &str) -> Result<(), ControlError> {
        let task = self.find(id)?;
        task.cancel()
            .inspect_err(|e| warn!("Cancel rejected: {}", e))?;

        info!("Cancelled task {}", id);
        self.events.push_progress(task.snapshot("task cancelled"));
        self.gate.notify_one();
        Ok(())
    }

    /// Cancel a task, then forget it and its result
    pub fn delete_task(&self, id: &str) -> Result<(), ControlError> {
        let task = self.find(id)?;
        if let Err(e) = task.cancel() {
            debug!("Deleting task {} without cancelling: {}", id, e);
        }
        task.retire();

        self.tasks.remove(id);
        self.context.remove(id);

        info!("Deleted task {}", id);
        self.events.push_progress(TaskProgress::new(
            id,
            TaskStatus::Cancelled,
            task.progress(),
            "task deleted",
        ));
        self.events.refresh_statistics();
        Ok(())
    }

    fn apply_all<P, F>(&self, action: &str, mut eligible: P, mut apply: F) -> usize
    where
        P: FnMut(&CompositeTask) -> bool,
        F: FnMut(&str) -> Result<(), ControlError>,
    {
        let affected = self
            .events
            .tasks_in_order()
            .iter()
            .filter(|task| eligible(task))
            .filter(|task| apply(task.id()).is_ok())
            .count();
        info!("{} applied to {} tasks", action, affected);
        affected
    }

    /// Pause every pending or running task whose current sub-task supports it
    pub fn pause_all(&self) -> usize {
        self.apply_all(
            "pause",
            |task| task.status().is_normal() && task.supports_pause(),
            |id| self.pause_task(id),
        )
    }

    /// Resume paused tasks and restart failed ones
    pub fn resume_all(&self) -> usize {
        self.apply_all(
            "resume",
            |task| matches!(task.status(), TaskStatus::Paused | TaskStatus::Failed),
            |id| self.resume_task(id),
        )
    }

    pub fn retry_all(&self) -> usize {
        self.apply_all(
            "retry",
            |task| task.status().is_retryable(),
            |id| self.retry_task(id),
        )
    }

    /// Cancel every task that has not finished yet
    pub fn cancel_all(&self) -> usize {
        self.apply_all(
            "cancel",
            |task| !task.status().is_terminal(),
            |id| self.cancel_task(id),
        )
    }

    pub fn delete_all(&self) -> usize {
        self.apply_all("delete", |_| true, |id| self.delete_task(id))
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|entry| entry.value().status())
    }

    pub fn task(&self, id: &str) -> Option<Arc<CompositeTask>> {
        self.tasks.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Every registered task in submission order
    pub fn tasks(&self) -> Vec<Arc<CompositeTask>> {
        self.events.tasks_in_order()
    }

    pub fn task_result(&self, id: &str) -> Option<TaskResult> {
        self.context.result(id)
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    pub fn locks(&self) -> &Arc<ResourceLockRegistry> {
        &self.locks
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn statistics(&self) -> TaskStatistics {
        self.events.compute_statistics()
    }

    pub fn pending_count(&self) -> usize {
        self.statistics().pending
    }

    pub fn running_count(&self) -> usize {
        self.statistics().running
    }

    /// Pending plus running tasks
    pub fn normal_count(&self) -> usize {
        let stats = self.statistics();
        stats.pending + stats.running
    }

    pub fn add_progress_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TaskProgress) + Send + Sync + 'static,
    {
        self.events.add_progress_listener(callback)
    }

    pub fn remove_progress_callback(&self, id: ListenerId) -> bool {
        self.events.remove_progress_listener(id)
    }

    pub fn add_statistics_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TaskStatistics) + Send + Sync + 'static,
    {
        self.events.add_statistics_listener(callback)
    }

    pub fn remove_statistics_callback(&self, id: ListenerId) -> bool {
        self.events.remove_statistics_listener(id)
    }

    pub fn add_running_count_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.events.add_running_count_listener(callback)
    }

    pub fn remove_running_count_callback(&self, id: ListenerId) -> bool {
        self.events.remove_running_count_listener(id)
    }

    pub fn add_pending_count_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.events.add_pending_count_listener(callback)
    }

    pub fn remove_pending_count_callback(&self, id: ListenerId) -> bool {
        self.events.remove_pending_count_listener(id)
    }

    pub fn add_task_added_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&[Arc<CompositeTask>]) + Send + Sync + 'static,
    {
        self.events.add_task_added_listener(callback)
    }

    pub fn remove_task_added_callback(&self, id: ListenerId) -> bool {
        self.events.remove_task_added_listener(id)
    }

    pub fn add_batch_completion_callback<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&[TaskCompletionInfo]) + Send + Sync + 'static,
    {
        self.events.add_batch_completion_listener(callback)
    }

    pub fn remove_batch_completion_callback(&self, id: ListenerId) -> bool {
        self.events.remove_batch_completion_listener(id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.lock().is_none() || self.scheduler.is_shut_down()
    }

    /// Close the queue, cancel every task and wait for all work to stop
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().take();
        if sender.is_none() {
            debug!("Task manager already shut down");
            return;
        }
        drop(sender);

        info!("Shutting down task manager");
        let cancelled = self.cancel_all();
        self.scheduler.shutdown().await;
        self.events.flush();
        info!("Task manager shut down ({} tasks cancelled)", cancelled);
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.scheduler.shutdown_token().cancel();
    }
}

async fn run_ticker(events: Arc<EventAggregator>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => events.flush(),
        }
    }

    events.flush();
    debug!("Event ticker stopped");
}
