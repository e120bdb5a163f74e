//! Simulated workload for the `run` command.
//!
//! Every sub-task sleeps through a few steps while holding a permit of one
//! shared resource, reports progress, and fails at random according to the
//! configured rate. With `--chain`, each task depends on the previous one.

use super::args::RunConfig;
use crate::task::{
    BuildError, CompositeTask, FnSubTask, SubTaskResult, TaskError, TaskManager,
    TaskManagerConfig, TaskStatistics, TaskStatus,
};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resource key every simulated sub-task locks
pub const SHARED_RESOURCE: &str = "simulated-worker";

const STEPS_PER_SUB_TASK: u32 = 4;

/// Build the composite tasks described by `config`
pub fn build_workload(config: &RunConfig) -> Result<Vec<CompositeTask>, BuildError> {
    let mut tasks = Vec::with_capacity(config.tasks);

    for index in 1..=config.tasks {
        let mut builder =
            CompositeTask::builder(format!("task-{}", index), format!("Simulated task {}", index))
                .priority(i32::try_from(index).unwrap_or(i32::MAX));
        if config.chain && index > 1 {
            builder = builder.depends_on([format!("task-{}", index - 1)]);
        }

        for sub_index in 1..=config.sub_tasks {
            builder = builder.sub_task(simulated_sub_task(index, sub_index, config)?);
        }

        tasks.push(builder.build()?);
    }

    Ok(tasks)
}

fn simulated_sub_task(
    task_index: usize,
    sub_index: usize,
    config: &RunConfig,
) -> Result<FnSubTask, BuildError> {
    let step = Duration::from_millis(config.step_ms);
    let fail_rate = config.fail_rate;

    FnSubTask::builder(
        format!("task-{}-step-{}", task_index, sub_index),
        format!("Step {} of task {}", sub_index, task_index),
    )
    .resource_lock(SHARED_RESOURCE, config.permits)
    .pausable()
    .handler(move |context, progress| async move {
        for done in 1..=STEPS_PER_SUB_TASK {
            context.check_pause_and_wait().await?;
            tokio::time::sleep(step).await;
            progress.report(
                f64::from(done) / f64::from(STEPS_PER_SUB_TASK),
                format!("step {}/{}", done, STEPS_PER_SUB_TASK),
            );
        }

        let failed = rand::rng().random_bool(fail_rate);
        if failed {
            return Ok(SubTaskResult::failure("simulated failure"));
        }

        // Each sub-task counts one higher than the one before it.
        let previous = context.last_result_as::<i64>().unwrap_or(0);
        Ok::<_, TaskError>(SubTaskResult::with_data(previous + 1))
    })
    .build()
}

/// Cancel pending tasks whose dependencies can no longer succeed
pub fn cancel_blocked(manager: &TaskManager) -> usize {
    let mut cancelled = 0;
    for task in manager.tasks() {
        if task.status() != TaskStatus::Pending {
            continue;
        }

        let blocked = task.dependencies().iter().any(|dependency| {
            !matches!(
                manager.task_status(dependency),
                Some(TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused | TaskStatus::Completed)
            )
        });

        if blocked && manager.cancel_task(task.id()).is_ok() {
            warn!("Cancelled {}: a dependency failed", task.id());
            cancelled += 1;
        }
    }
    cancelled
}

/// Run the workload to completion and return the final statistics
pub async fn run_workload(
    task_config: TaskManagerConfig,
    config: &RunConfig,
) -> anyhow::Result<TaskStatistics> {
    let tasks = build_workload(config)?;
    let manager = TaskManager::new(task_config);

    let verbose = config.verbose;
    manager.add_progress_callback(move |progress| {
        if verbose {
            info!(
                "{} {} {:.0}% - {}",
                progress.task_id,
                progress.status,
                progress.progress * 100.0,
                progress.message
            );
        } else {
            debug!(
                "{} {} {:.0}%",
                progress.task_id,
                progress.status,
                progress.progress * 100.0
            );
        }
    });
    manager.add_statistics_callback(|stats| {
        info!(
            "pending={} running={} completed={} failed={} cancelled={} total={}",
            stats.pending, stats.running, stats.completed, stats.failed, stats.cancelled, stats.total
        );
    });
    manager.add_batch_completion_callback(|batch| {
        for completion in batch {
            info!(
                "{} finished as {} ({} ok, {} failed sub-tasks)",
                completion.task_name,
                completion.status,
                completion.successful_sub_task_count(),
                completion.failed_sub_task_count()
            );
        }
    });

    let added = manager.add_tasks(tasks);
    info!("Submitted {} tasks", added.len());

    let poll = manager.config().tick_interval();
    loop {
        tokio::time::sleep(poll).await;
        let stats = manager.statistics();
        if stats.active() == 0 {
            break;
        }
        if stats.running == 0 && stats.paused == 0 {
            cancel_blocked(&manager);
        }
    }

    // One more tick so the last batch reaches the listeners.
    tokio::time::sleep(poll).await;
    let stats = manager.statistics();
    manager.shutdown().await;
    Ok(stats)
}
