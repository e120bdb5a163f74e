//! # Taskweave
//!
//! A concurrent, dependency-aware task execution engine. Composite tasks made
//! of ordered sub-tasks are queued, gated on their dependencies, executed
//! concurrently, and observed through batched notifications.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: the engine itself
//!   - resource lock registry: named permit-counted semaphores
//!   - composite task state machine with pause, resume, cancel and retry
//!   - queue processor with dependency gating and parking
//!   - event aggregator that batches progress and completion events on a tick
//!   - [`TaskManager`]: submission, control, queries, subscriptions, shutdown
//! - **[`cli`]**: argument parsing, configuration discovery, simulated workload
//! - **[`env`]**: path and environment variable constants
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskweave::{CompositeTask, FnSubTask, SubTaskResult, TaskError, TaskManager, TaskManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = TaskManager::new(TaskManagerConfig::default());
//!
//!     manager.add_batch_completion_callback(|batch| {
//!         for completion in batch {
//!             println!("{} finished as {}", completion.task_id, completion.status);
//!         }
//!     });
//!
//!     let fetch = FnSubTask::builder("fetch", "Fetch")
//!         .resource_lock("network", 2)
//!         .handler(|_, progress| async move {
//!             progress.report(1.0, "fetched");
//!             Ok::<_, TaskError>(SubTaskResult::with_data("payload"))
//!         })
//!         .build()?;
//!
//!     let task = CompositeTask::builder("download", "Download").sub_task(fetch).build()?;
//!     manager.add_task(task);
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(500)).await;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Composite task engine.
///
/// Resource locks, the task and result model, the sub-task contract, the
/// composite state machine, scheduling, event batching and the manager API.
pub mod task;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use task::{
    CompositeTask, ControlError, FnSubTask, ListenerId, Payload, ResourceLock, SubTask,
    SubTaskResult, TaskBuilder, TaskError, TaskManager, TaskManagerConfig, TaskResult,
    TaskStatistics, TaskStatus,
};
