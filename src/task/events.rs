//! Listener registry and batching of progress and completion events.
//!
//! Execution pushes events into two buffers; [`EventAggregator::flush`]
//! drains them once per tick and fans them out. Listeners run outside of the
//! buffer and listener-list locks, and a panicking listener is logged and
//! skipped. Statistics refreshes are serialized so listeners never see an
//! older snapshot after a newer one.

use crate::task::composite::{CompositeTask, panic_message};
use crate::task::types::{TaskCompletionInfo, TaskId, TaskProgress, TaskStatistics};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Table of every registered task, keyed by id
pub type TaskTable = DashMap<TaskId, Arc<CompositeTask>>;

/// Handle returned by subscriptions, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T: ?Sized> {
    kind: &'static str,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T: ?Sized> ListenerSet<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.lock().push((id, listener));
        debug!("Registered {} listener {:?}", self.kind, id);
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            self.invoke(&listener, value);
        }
    }

    fn invoke(&self, listener: &Listener<T>, value: &T) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| listener(value))) {
            error!(
                "{} listener panicked: {}",
                self.kind,
                panic_message(panic.as_ref())
            );
        }
    }
}

/// Buffers execution events and delivers them to listeners in batches
pub struct EventAggregator {
    tasks: Arc<TaskTable>,
    progress_buffer: Mutex<Vec<TaskProgress>>,
    completion_buffer: Mutex<Vec<TaskCompletionInfo>>,
    statistics: Mutex<TaskStatistics>,
    // Reentrant so a statistics listener may subscribe or refresh again.
    refresh: ReentrantMutex<()>,
    progress_listeners: ListenerSet<TaskProgress>,
    statistics_listeners: ListenerSet<TaskStatistics>,
    running_listeners: ListenerSet<usize>,
    pending_listeners: ListenerSet<usize>,
    task_added_listeners: ListenerSet<[Arc<CompositeTask>]>,
    completion_listeners: ListenerSet<[TaskCompletionInfo]>,
}

impl EventAggregator {
    pub fn new(tasks: Arc<TaskTable>) -> Self {
        Self {
            tasks,
            progress_buffer: Mutex::new(Vec::new()),
            completion_buffer: Mutex::new(Vec::new()),
            statistics: Mutex::new(TaskStatistics::default()),
            refresh: ReentrantMutex::new(()),
            progress_listeners: ListenerSet::new("progress"),
            statistics_listeners: ListenerSet::new("statistics"),
            running_listeners: ListenerSet::new("running-count"),
            pending_listeners: ListenerSet::new("pending-count"),
            task_added_listeners: ListenerSet::new("task-added"),
            completion_listeners: ListenerSet::new("batch-completion"),
        }
    }

    pub fn push_progress(&self, progress: TaskProgress) {
        self.progress_buffer.lock().push(progress);
    }

    pub fn push_completion(&self, completion: TaskCompletionInfo) {
        self.completion_buffer.lock().push(completion);
    }

    /// Drain both buffers and notify listeners. Called once per tick.
    pub fn flush(&self) {
        let progress = std::mem::take(&mut *self.progress_buffer.lock());
        let completions = std::mem::take(&mut *self.completion_buffer.lock());

        if !progress.is_empty() {
            for event in &progress {
                self.progress_listeners.notify(event);
            }
            self.refresh_statistics();
        }

        if !completions.is_empty() {
            debug!("Delivering batch of {} completions", completions.len());
            self.completion_listeners.notify(completions.as_slice());
        }
    }

    /// Count statuses over the task table
    pub fn compute_statistics(&self) -> TaskStatistics {
        TaskStatistics::from_statuses(self.tasks.iter().map(|entry| entry.value().status()))
    }

    /// Recompute statistics and notify the count listeners whose value changed
    pub fn refresh_statistics(&self) -> TaskStatistics {
        let _refresh = self.refresh.lock();
        let current = self.compute_statistics();
        let previous = std::mem::replace(&mut *self.statistics.lock(), current);

        if previous != current {
            self.statistics_listeners.notify(&current);
        }
        if previous.running != current.running {
            self.running_listeners.notify(&current.running);
        }
        if previous.pending != current.pending {
            self.pending_listeners.notify(&current.pending);
        }
        current
    }

    /// Last statistics snapshot delivered to listeners
    pub fn current_statistics(&self) -> TaskStatistics {
        *self.statistics.lock()
    }

    /// Deliver newly registered tasks synchronously
    pub fn notify_task_added(&self, tasks: &[Arc<CompositeTask>]) {
        if !tasks.is_empty() {
            self.task_added_listeners.notify(tasks);
        }
    }

    /// Registered tasks in submission order
    pub(crate) fn tasks_in_order(&self) -> Vec<Arc<CompositeTask>> {
        let mut tasks: Vec<Arc<CompositeTask>> = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tasks.sort_by(|a, b| {
            a.submission_index()
                .cmp(&b.submission_index())
                .then_with(|| a.id().cmp(b.id()))
        });
        tasks
    }

    pub fn add_progress_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TaskProgress) + Send + Sync + 'static,
    {
        let listener: Listener<TaskProgress> = Arc::new(listener);
        for task in self.tasks_in_order() {
            self.progress_listeners
                .invoke(&listener, &task.snapshot("current state"));
        }
        self.progress_listeners.add(listener)
    }

    pub fn remove_progress_listener(&self, id: ListenerId) -> bool {
        self.progress_listeners.remove(id)
    }

    pub fn add_statistics_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TaskStatistics) + Send + Sync + 'static,
    {
        let listener: Listener<TaskStatistics> = Arc::new(listener);
        let _refresh = self.refresh.lock();
        let current = self.refresh_statistics();
        self.statistics_listeners.invoke(&listener, &current);
        self.statistics_listeners.add(listener)
    }

    pub fn remove_statistics_listener(&self, id: ListenerId) -> bool {
        self.statistics_listeners.remove(id)
    }

    pub fn add_running_count_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        let listener: Listener<usize> = Arc::new(listener);
        let _refresh = self.refresh.lock();
        let current = self.refresh_statistics();
        self.running_listeners.invoke(&listener, &current.running);
        self.running_listeners.add(listener)
    }

    pub fn remove_running_count_listener(&self, id: ListenerId) -> bool {
        self.running_listeners.remove(id)
    }

    pub fn add_pending_count_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        let listener: Listener<usize> = Arc::new(listener);
        let _refresh = self.refresh.lock();
        let current = self.refresh_statistics();
        self.pending_listeners.invoke(&listener, &current.pending);
        self.pending_listeners.add(listener)
    }

    pub fn remove_pending_count_listener(&self, id: ListenerId) -> bool {
        self.pending_listeners.remove(id)
    }

    pub fn add_task_added_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[Arc<CompositeTask>]) + Send + Sync + 'static,
    {
        let listener: Listener<[Arc<CompositeTask>]> = Arc::new(listener);
        let existing = self.tasks_in_order();
        if !existing.is_empty() {
            self.task_added_listeners
                .invoke(&listener, existing.as_slice());
        }
        self.task_added_listeners.add(listener)
    }

    pub fn remove_task_added_listener(&self, id: ListenerId) -> bool {
        self.task_added_listeners.remove(id)
    }

    pub fn add_batch_completion_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[TaskCompletionInfo]) + Send + Sync + 'static,
    {
        self.completion_listeners.add(Arc::new(listener))
    }

    pub fn remove_batch_completion_listener(&self, id: ListenerId) -> bool {
        self.completion_listeners.remove(id)
    }
}
