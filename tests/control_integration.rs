use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use taskweave::task::TaskProgress;
use taskweave::{
    CompositeTask, ControlError, FnSubTask, SubTask, SubTaskResult, TaskError, TaskManager,
    TaskManagerConfig, TaskStatistics, TaskStatus,
};

fn test_config() -> TaskManagerConfig {
    TaskManagerConfig {
        tick_interval_ms: 10,
        requeue_delay_ms: 50,
        ..Default::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "Timed out waiting for {}", what);
}

async fn wait_for_result(manager: &TaskManager, id: &str, status: TaskStatus) {
    wait_for(&format!("{} result of {}", status, id), || {
        manager
            .task_result(id)
            .is_some_and(|result| result.status == status)
    })
    .await;
}

/// Task with a quick first sub-task and a slow, cooperative second one
fn two_stage_task(id: &str, pausable: bool, steps: u32) -> CompositeTask {
    CompositeTask::builder(id, id)
        .sub_task_with(
            FnSubTask::builder("prepare", "Prepare")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::with_data(1i64)) }),
        )
        .sub_task_with(
            FnSubTask::builder("process", "Process")
                .supports_pause(pausable)
                .handler(move |context, progress| async move {
                    for step in 1..=steps {
                        context.check_pause_and_wait().await?;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        progress.report(f64::from(step) / f64::from(steps), "processing");
                    }
                    Ok::<_, TaskError>(SubTaskResult::with_data(2i64))
                }),
        )
        .build()
        .expect("Task should build")
}

/// Task that fails on its first `failures` runs, then succeeds
fn flaky_task(id: &str, failures: usize, attempts: &Arc<AtomicUsize>) -> CompositeTask {
    let attempts = Arc::clone(attempts);
    CompositeTask::builder(id, id)
        .sub_task_with(FnSubTask::builder("attempt", "Attempt").handler(move |_, _| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= failures {
                    Ok::<_, TaskError>(SubTaskResult::failure(format!("attempt {} failed", attempt)))
                } else {
                    Ok(SubTaskResult::with_data(attempt as i64))
                }
            }
        }))
        .build()
        .expect("Task should build")
}

fn is_processing(manager: &TaskManager, id: &str) -> bool {
    manager
        .task(id)
        .is_some_and(|task| task.supports_pause() && task.progress() > 0.5)
}

#[tokio::test]
async fn test_pause_and_resume_through_manager() {
    let manager = TaskManager::new(test_config());
    manager.add_task(two_stage_task("job", true, 60));

    wait_for("second sub-task to start", || is_processing(&manager, "job")).await;

    manager.pause_task("job").expect("Pause should be accepted");
    assert_eq!(manager.task_status("job"), Some(TaskStatus::Paused));
    assert_eq!(manager.statistics().paused, 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let frozen = manager.task("job").unwrap().progress();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(manager.task("job").unwrap().progress(), frozen);
    assert_eq!(manager.task_status("job"), Some(TaskStatus::Paused));

    manager.resume_task("job").expect("Resume should be accepted");
    wait_for_result(&manager, "job", TaskStatus::Completed).await;

    let result = manager.task_result("job").unwrap();
    assert_eq!(result.sub_task_data_as::<i64>("process"), Some(2));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pause_rejected_without_support() {
    let manager = TaskManager::new(test_config());
    manager.add_task(two_stage_task("rigid", false, 200));

    wait_for("second sub-task to start", || {
        manager
            .task("rigid")
            .and_then(|task| task.current_sub_task().map(|sub| sub.id() == "process"))
            .unwrap_or(false)
    })
    .await;

    assert_eq!(
        manager.pause_task("rigid"),
        Err(ControlError::PauseUnsupported("rigid".to_string()))
    );
    assert_eq!(manager.task_status("rigid"), Some(TaskStatus::Running));
    assert_eq!(manager.pause_all(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_cancel_keeps_partial_results() {
    let manager = TaskManager::new(test_config());
    manager.add_task(two_stage_task("job", false, 400));

    wait_for("second sub-task to start", || {
        manager
            .task("job")
            .is_some_and(|task| task.progress() > 0.5)
    })
    .await;

    manager.cancel_task("job").unwrap();
    assert_eq!(manager.task_status("job"), Some(TaskStatus::Cancelled));

    wait_for("cancelled result to be recorded", || {
        manager.task_result("job").is_some()
    })
    .await;

    let result = manager.task_result("job").unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(!result.success);
    assert_eq!(result.sub_task_data_as::<i64>("prepare"), Some(1));
    assert!(!result.sub_task_results.contains_key("process"));

    // Cancelling again is accepted
    assert!(manager.cancel_task("job").is_ok());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_reruns_failed_task() {
    let manager = TaskManager::new(test_config());
    let attempts = Arc::new(AtomicUsize::new(0));
    manager.add_task(flaky_task("flaky", 1, &attempts));

    wait_for_result(&manager, "flaky", TaskStatus::Failed).await;
    assert_eq!(
        manager.task_result("flaky").and_then(|r| r.error),
        Some("attempt 1 failed".to_string())
    );

    manager.retry_task("flaky").expect("Retry should be accepted");
    wait_for_result(&manager, "flaky", TaskStatus::Completed).await;

    let result = manager.task_result("flaky").unwrap();
    assert!(result.success);
    assert_eq!(result.sub_task_data_as::<i64>("attempt"), Some(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    assert!(matches!(
        manager.retry_task("flaky"),
        Err(ControlError::InvalidTransition { action: "retry", .. })
    ));

    manager.shutdown().await;
}

/// Decrements the shared counter when the sub-task body ends or is dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_retry_after_cancel_never_overlaps_runs() {
    let manager = TaskManager::new(test_config());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));

    let (counter, max, tries) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&attempts));
    let task = CompositeTask::builder("stubborn", "Stubborn")
        .sub_task_with(FnSubTask::builder("sleep", "Sleep").handler(move |_, _| {
            let counter = Arc::clone(&counter);
            let max = Arc::clone(&max);
            tries.fetch_add(1, Ordering::SeqCst);
            async move {
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                let _guard = ActiveGuard(counter);
                // Never checks for pause or cancellation
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, TaskError>(SubTaskResult::success())
            }
        }))
        .build()
        .unwrap();
    manager.add_task(task);

    wait_for("sub-task to start", || active.load(Ordering::SeqCst) == 1).await;
    manager.cancel_task("stubborn").unwrap();
    manager.retry_task("stubborn").expect("Retry should be accepted");

    wait_for_result(&manager, "stubborn", TaskStatus::Completed).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(active.load(Ordering::SeqCst), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_resume_restarts_cancelled_task() {
    let manager = TaskManager::new(test_config());
    let blocked = CompositeTask::builder("blocked", "Blocked")
        .depends_on(["never"])
        .sub_task_with(
            FnSubTask::builder("noop", "Noop")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::success()) }),
        )
        .build()
        .unwrap();
    manager.add_task(blocked);

    manager.cancel_task("blocked").unwrap();
    assert_eq!(manager.task_status("blocked"), Some(TaskStatus::Cancelled));

    manager.resume_task("blocked").unwrap();
    assert_eq!(manager.task_status("blocked"), Some(TaskStatus::Pending));

    // Still gated on the missing dependency
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.task_status("blocked"), Some(TaskStatus::Pending));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_forgets_task_and_result() {
    let manager = TaskManager::new(test_config());
    manager.add_task(two_stage_task("short", false, 1));
    manager.add_task(two_stage_task("long", true, 400));

    wait_for("short task to complete", || {
        manager.task_status("short") == Some(TaskStatus::Completed)
    })
    .await;
    wait_for("long task to start", || {
        manager.task_status("long") == Some(TaskStatus::Running)
    })
    .await;

    let long = manager.task("long").unwrap();
    manager.delete_task("short").unwrap();
    manager.delete_task("long").unwrap();

    assert!(manager.task("short").is_none());
    assert!(manager.task_result("short").is_none());
    assert!(manager.task_status("long").is_none());
    assert_eq!(long.status(), TaskStatus::Cancelled);
    assert_eq!(
        manager.delete_task("long"),
        Err(ControlError::NotFound("long".to_string()))
    );

    // The cancelled run must not write a result for a deleted task
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(manager.task_result("long").is_none());
    assert_eq!(manager.statistics(), TaskStatistics::default());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_ids_are_rejected() {
    let manager = TaskManager::new(test_config());
    let missing = || ControlError::NotFound("ghost".to_string());

    assert_eq!(manager.pause_task("ghost"), Err(missing()));
    assert_eq!(manager.resume_task("ghost"), Err(missing()));
    assert_eq!(manager.retry_task("ghost"), Err(missing()));
    assert_eq!(manager.cancel_task("ghost"), Err(missing()));
    assert_eq!(manager.delete_task("ghost"), Err(missing()));
    assert!(manager.task_status("ghost").is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_bulk_operations() {
    let manager = TaskManager::new(test_config());
    let attempts = Arc::new(AtomicUsize::new(0));
    manager.add_tasks([
        flaky_task("f1", 10, &attempts),
        flaky_task("f2", 10, &attempts),
    ]);
    manager.add_task(two_stage_task("slow", true, 400));

    wait_for("flaky tasks to fail", || manager.statistics().failed == 2).await;
    wait_for("slow task to reach pausable work", || is_processing(&manager, "slow")).await;

    assert_eq!(manager.pause_all(), 1);
    assert_eq!(manager.task_status("slow"), Some(TaskStatus::Paused));

    // Paused plus failed tasks
    assert_eq!(manager.resume_all(), 3);
    wait_for("flaky tasks to fail again", || {
        manager.statistics().failed == 2 && attempts.load(Ordering::SeqCst) == 4
    })
    .await;

    assert_eq!(manager.retry_all(), 2);
    assert_eq!(manager.cancel_all(), 3);
    wait_for("everything to settle as cancelled", || {
        let stats = manager.statistics();
        stats.cancelled == 3 && stats.active() == 0
    })
    .await;

    assert_eq!(manager.retry_all(), 3);
    assert_eq!(manager.delete_all(), 3);
    assert!(manager.tasks().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_statistics_listeners_replay_and_update() {
    let manager = TaskManager::new(test_config());
    manager.add_task(two_stage_task("a", false, 2));

    let snapshots: Arc<Mutex<Vec<TaskStatistics>>> = Arc::default();
    let recorder = Arc::clone(&snapshots);
    let id = manager.add_statistics_callback(move |stats| recorder.lock().push(*stats));
    assert_eq!(snapshots.lock().len(), 1, "Current statistics replayed on subscribe");
    assert_eq!(snapshots.lock()[0].total, 1);

    let pending_counts: Arc<Mutex<Vec<usize>>> = Arc::default();
    let recorder = Arc::clone(&pending_counts);
    manager.add_pending_count_callback(move |count| recorder.lock().push(*count));
    assert_eq!(pending_counts.lock().len(), 1);

    wait_for("completion to be reflected", || {
        snapshots.lock().last().is_some_and(|stats| stats.completed == 1)
    })
    .await;
    assert!(snapshots.lock().iter().all(TaskStatistics::is_consistent));
    for pair in snapshots.lock().windows(2) {
        assert_ne!(pair[0], pair[1], "Only changed statistics are delivered");
    }

    assert!(manager.remove_statistics_callback(id));
    let delivered = snapshots.lock().len();
    manager.add_task(two_stage_task("b", false, 2));
    wait_for("second task to complete", || {
        manager.task_status("b") == Some(TaskStatus::Completed)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(snapshots.lock().len(), delivered);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_panicking_listener_does_not_break_delivery() {
    let manager = TaskManager::new(test_config());
    manager.add_progress_callback(|_| panic!("listener bug"));

    let events: Arc<Mutex<Vec<TaskProgress>>> = Arc::default();
    let recorder = Arc::clone(&events);
    manager.add_progress_callback(move |progress| recorder.lock().push(progress.clone()));

    manager.add_task(two_stage_task("job", false, 2));
    wait_for("completion event", || {
        events
            .lock()
            .iter()
            .any(|event| event.task_id == "job" && event.status == TaskStatus::Completed)
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_control_after_shutdown() {
    let manager = TaskManager::new(test_config());
    let attempts = Arc::new(AtomicUsize::new(0));
    manager.add_task(flaky_task("flaky", 10, &attempts));

    wait_for("task to fail", || {
        manager.task_status("flaky") == Some(TaskStatus::Failed)
    })
    .await;
    manager.shutdown().await;

    assert_eq!(manager.retry_task("flaky"), Err(ControlError::ShutDown));
    assert_eq!(manager.resume_task("flaky"), Err(ControlError::ShutDown));
    assert_eq!(manager.task_status("flaky"), Some(TaskStatus::Failed));
    assert!(manager.add_tasks([flaky_task("new", 0, &attempts)]).is_empty());
}
