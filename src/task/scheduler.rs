//! Runtime scope and the queue processor.
//!
//! One processor loop consumes the submission queue in FIFO order and
//! decides, per task, whether to drop it, park it until a gate may have
//! cleared, or launch it on the scheduler. Parked tasks are re-evaluated when
//! something notifies the gate, with a fixed delay as fallback.

use crate::task::composite::{CompositeTask, ProgressSink, RunTicket, panic_message};
use crate::task::context::TaskContext;
use crate::task::events::{EventAggregator, TaskTable};
use crate::task::lock::ResourceLockRegistry;
use crate::task::result::TaskResult;
use crate::task::types::{TaskCompletionInfo, TaskId, TaskProgress, TaskStatus};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Explicit runtime scope owned by a task manager.
///
/// Every background loop and task run is spawned through it, and every run
/// token is a child of its root token, so [`Scheduler::shutdown`] reaches all
/// of them.
#[derive(Debug)]
pub struct Scheduler {
    handle: Handle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Scope bound to the runtime of the caller.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(future, &self.handle)
    }

    /// Fresh token for one task run, cancelled on shutdown
    pub fn run_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of spawned futures that have not finished yet
    pub fn active_count(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait for all tracked work to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Scheduler drained");
    }
}

/// Shared state a task run needs, and the logic that launches runs
pub(crate) struct Dispatcher {
    pub(crate) tasks: Arc<TaskTable>,
    pub(crate) context: Arc<TaskContext>,
    pub(crate) locks: Arc<ResourceLockRegistry>,
    pub(crate) events: Arc<EventAggregator>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) gate: Arc<Notify>,
    pub(crate) slots: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    fn progress_sink(&self) -> ProgressSink {
        let events = Arc::clone(&self.events);
        Arc::new(move |progress: TaskProgress| events.push_progress(progress))
    }

    /// Attach a run token to `task` and spawn its execution
    pub(crate) fn launch(self: &Arc<Self>, task: Arc<CompositeTask>) {
        let ticket = task.attach_run(self.scheduler.run_token());
        let dispatcher = Arc::clone(self);
        debug!("Launching task {}", task.id());

        self.scheduler.spawn(async move {
            dispatcher.run(task, ticket).await;
        });
    }

    async fn run(&self, task: Arc<CompositeTask>, ticket: RunTicket) {
        // A cancelled run may still be unwinding when a retry launches.
        let _exclusive = task.exclusive_run().await;

        let _slot = match &self.slots {
            Some(slots) => {
                tokio::select! {
                    biased;
                    _ = ticket.token().cancelled() => None,
                    permit = Arc::clone(slots).acquire_owned() => permit.ok(),
                }
            }
            None => None,
        };

        let sink = self.progress_sink();
        let result = task
            .execute(&ticket, &self.context, &self.locks, &sink)
            .await;
        self.complete(&task, &ticket, result);
    }

    fn complete(&self, task: &Arc<CompositeTask>, ticket: &RunTicket, result: TaskResult) {
        let recorded = match self.tasks.get(task.id()) {
            // Holding the table entry keeps a concurrent delete from
            // interleaving with the result write.
            Some(entry) if Arc::ptr_eq(entry.value(), task) => task.if_current_run(ticket, || {
                self.context.record(task.id(), result.clone());
            }),
            _ => false,
        };

        if !recorded {
            debug!(
                "Run of task {} finished after it was deleted or restarted",
                task.id()
            );
            self.gate.notify_one();
            return;
        }

        if let Some(callback) = task.completion_callback() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result))) {
                error!(
                    "Completion callback of task {} panicked: {}",
                    task.id(),
                    panic_message(panic.as_ref())
                );
            }
        }

        self.events
            .push_completion(TaskCompletionInfo::from_result(task.id(), task.name(), &result));
        self.gate.notify_one();
    }
}

/// What the processor decided for one dequeued task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Dropped,
    Parked,
    Launched,
}

/// The single consumer of the submission queue
pub(crate) struct QueueProcessor {
    queue: mpsc::UnboundedReceiver<TaskId>,
    dispatcher: Arc<Dispatcher>,
    requeue_delay: Duration,
    event_driven: bool,
}

impl QueueProcessor {
    pub(crate) fn new(
        queue: mpsc::UnboundedReceiver<TaskId>,
        dispatcher: Arc<Dispatcher>,
        requeue_delay: Duration,
        event_driven: bool,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            requeue_delay,
            event_driven,
        }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.dispatcher.scheduler.shutdown_token().clone();
        let gate = Arc::clone(&self.dispatcher.gate);
        let mut ready: VecDeque<TaskId> = VecDeque::new();
        let mut parked: Vec<TaskId> = Vec::new();
        let mut recheck_at: Option<Instant> = None;

        info!("Queue processor started");

        loop {
            while let Some(id) = ready.pop_front() {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| self.process(&id)));
                match outcome {
                    Ok(Disposition::Parked) => parked.push(id),
                    Ok(_) => {}
                    Err(panic) => error!(
                        "Queue processor failed while dispatching task {}: {}",
                        id,
                        panic_message(panic.as_ref())
                    ),
                }
            }

            if parked.is_empty() {
                recheck_at = None;
            } else if recheck_at.is_none() {
                recheck_at = Some(Instant::now() + self.requeue_delay);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = gate.notified(), if self.event_driven && !parked.is_empty() => {
                    ready.extend(parked.drain(..));
                    recheck_at = None;
                }
                _ = sleep_until(recheck_at.unwrap_or_else(Instant::now)), if recheck_at.is_some() => {
                    ready.extend(parked.drain(..));
                    recheck_at = None;
                }
                received = self.queue.recv() => match received {
                    Some(id) => ready.push_back(id),
                    None => {
                        debug!("Submission queue closed");
                        break;
                    }
                },
            }
        }

        info!(
            "Queue processor stopped with {} parked tasks",
            parked.len()
        );
    }

    fn process(&self, id: &str) -> Disposition {
        let Some(task) = self
            .dispatcher
            .tasks
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!("Dropping task {}: no longer registered", id);
            return Disposition::Dropped;
        };

        match task.status() {
            TaskStatus::Cancelled => {
                task.clear_queued();
                debug!("Dropping cancelled task {}", id);
                return Disposition::Dropped;
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                task.clear_queued();
                warn!("Dropping task {} already in status {}", id, task.status());
                return Disposition::Dropped;
            }
            TaskStatus::Paused => {
                debug!("Parking paused task {}", id);
                return Disposition::Parked;
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        if !self
            .dispatcher
            .context
            .dependencies_satisfied(task.dependencies())
        {
            debug!("Parking task {}: dependencies not satisfied", id);
            return Disposition::Parked;
        }

        task.clear_queued();
        self.dispatcher.launch(task);
        Disposition::Launched
    }
}
