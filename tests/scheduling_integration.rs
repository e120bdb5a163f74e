use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use taskweave::task::{TaskCompletionInfo, TaskProgress};
use taskweave::{
    CompositeTask, FnSubTask, SubTaskResult, TaskError, TaskManager, TaskManagerConfig, TaskStatus,
};

fn test_config() -> TaskManagerConfig {
    TaskManagerConfig {
        tick_interval_ms: 10,
        requeue_delay_ms: 50,
        ..Default::default()
    }
}

/// Parked tasks are only re-evaluated by the fixed requeue delay
fn polling_config() -> TaskManagerConfig {
    TaskManagerConfig {
        tick_interval_ms: 10,
        requeue_delay_ms: 30,
        event_driven_wakeup: false,
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

fn sleeping_task(id: &str, millis: u64) -> CompositeTask {
    CompositeTask::builder(id, id)
        .sub_task_with(FnSubTask::builder("sleep", "Sleep").handler(move |_, progress| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            progress.report(1.0, "slept");
            Ok::<_, TaskError>(SubTaskResult::success())
        }))
        .build()
        .expect("Task should build")
}

/// Task whose single sub-task tracks how many run at once
fn concurrency_tracked(
    id: &str,
    lock: Option<(&str, usize)>,
    active: &Arc<AtomicUsize>,
    peak: &Arc<AtomicUsize>,
) -> CompositeTask {
    let active = Arc::clone(active);
    let peak = Arc::clone(peak);
    let mut sub_task = FnSubTask::builder("tracked", "Tracked").handler(move |_, _| {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, TaskError>(SubTaskResult::success())
        }
    });
    if let Some((key, permits)) = lock {
        sub_task = sub_task.resource_lock(key, permits);
    }

    CompositeTask::builder(id, id)
        .sub_task_with(sub_task)
        .build()
        .expect("Task should build")
}

#[tokio::test]
async fn test_independent_tasks_complete() {
    let manager = TaskManager::new(test_config());

    let added = manager.add_tasks([
        sleeping_task("a", 10),
        sleeping_task("b", 10),
        sleeping_task("c", 10),
    ]);
    assert_eq!(added, vec!["a", "b", "c"]);

    for id in ["a", "b", "c"] {
        wait_for_result(&manager, id, TaskStatus::Completed).await;
        let result = manager.task_result(id).expect("Result should be recorded");
        assert!(result.success, "Task {} should succeed", id);
        assert_eq!(manager.task_status(id), Some(TaskStatus::Completed));
    }
    assert!(manager.statistics().is_consistent());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_dependency_gates_execution() {
    let manager = TaskManager::new(test_config());
    let order = Arc::new(Mutex::new(Vec::new()));

    let recorder = Arc::clone(&order);
    let upstream = CompositeTask::builder("upstream", "Upstream")
        .sub_task_with(FnSubTask::builder("produce", "Produce").handler(move |_, _| {
            let recorder = Arc::clone(&recorder);
            async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                recorder.lock().push("upstream");
                Ok::<_, TaskError>(SubTaskResult::with_data(21i64))
            }
        }))
        .build()
        .unwrap();

    let recorder = Arc::clone(&order);
    let downstream = CompositeTask::builder("downstream", "Downstream")
        .depends_on(["upstream"])
        .sub_task_with(FnSubTask::builder("consume", "Consume").handler(move |context, _| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().push("downstream");
                let input = context
                    .dependency_result("upstream")
                    .and_then(|result| result.sub_task_data_as::<i64>("produce"))
                    .ok_or_else(|| TaskError::Failed("missing upstream data".to_string()))?;
                Ok::<_, TaskError>(SubTaskResult::with_data(input * 2))
            }
        }))
        .build()
        .unwrap();

    // Submitted first, but must wait for its dependency
    manager.add_tasks([downstream, upstream]);

    wait_for_result(&manager, "downstream", TaskStatus::Completed).await;

    assert_eq!(*order.lock(), vec!["upstream", "downstream"]);
    let result = manager.task_result("downstream").unwrap();
    assert_eq!(result.sub_task_data_as::<i64>("consume"), Some(42));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_dependency_waits_until_submitted() {
    let manager = TaskManager::new(test_config());

    let waiting = CompositeTask::builder("waiting", "Waiting")
        .depends_on(["late"])
        .sub_task_with(
            FnSubTask::builder("noop", "Noop")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::success()) }),
        )
        .build()
        .unwrap();
    manager.add_task(waiting);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(manager.task_status("waiting"), Some(TaskStatus::Pending));

    manager.add_task(sleeping_task("late", 5));
    wait_for("dependent task to complete", || {
        manager.task_status("waiting") == Some(TaskStatus::Completed)
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let manager = TaskManager::new(test_config());

    let failing = CompositeTask::builder("failing", "Failing")
        .sub_task_with(
            FnSubTask::builder("fail", "Fail")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::failure("broken")) }),
        )
        .build()
        .unwrap();
    let dependent = CompositeTask::builder("dependent", "Dependent")
        .depends_on(["failing"])
        .sub_task_with(
            FnSubTask::builder("noop", "Noop")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::success()) }),
        )
        .build()
        .unwrap();

    manager.add_tasks([failing, dependent]);
    wait_for("dependency to fail", || {
        manager.task_status("failing") == Some(TaskStatus::Failed)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(manager.task_status("dependent"), Some(TaskStatus::Pending));
    assert!(manager.task_result("dependent").is_none());

    manager.cancel_task("dependent").unwrap();
    assert_eq!(manager.task_status("dependent"), Some(TaskStatus::Cancelled));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_resource_lock_bounds_concurrency_across_tasks() {
    let manager = TaskManager::new(test_config());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6)
        .map(|i| concurrency_tracked(&format!("gpu-{}", i), Some(("gpu", 2)), &active, &peak))
        .collect();
    manager.add_tasks(tasks);

    wait_for("all tracked tasks to complete", || manager.statistics().completed == 6).await;

    assert!(peak.load(Ordering::SeqCst) <= 2, "At most two holders of the gpu lock");
    assert_eq!(manager.locks().configured_permits("gpu"), Some(2));
    assert_eq!(manager.locks().available_permits("gpu"), Some(2));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_max_concurrent_tasks_limit() {
    let config = TaskManagerConfig {
        max_concurrent_tasks: Some(1),
        ..test_config()
    };
    let manager = TaskManager::new(config);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..3)
        .map(|i| concurrency_tracked(&format!("slot-{}", i), None, &active, &peak))
        .collect();
    manager.add_tasks(tasks);

    wait_for("all tracked tasks to complete", || manager.statistics().completed == 3).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_fail_fast_records_partial_results() {
    let manager = TaskManager::new(test_config());
    let later_runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&later_runs);
    let task = CompositeTask::builder("pipeline", "Pipeline")
        .sub_task_with(
            FnSubTask::builder("fetch", "Fetch")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::with_data("page")) }),
        )
        .sub_task_with(
            FnSubTask::builder("parse", "Parse")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::failure("bad markup")) }),
        )
        .sub_task_with(FnSubTask::builder("store", "Store").handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TaskError>(SubTaskResult::success()) }
        }))
        .build()
        .unwrap();
    manager.add_task(task);

    wait_for_result(&manager, "pipeline", TaskStatus::Failed).await;

    let result = manager.task_result("pipeline").expect("Failed result is recorded");
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("bad markup"));
    assert_eq!(
        result.sub_task_data_as::<String>("fetch").as_deref(),
        Some("page")
    );
    assert!(!result.sub_task_results.contains_key("store"));
    assert_eq!(later_runs.load(Ordering::SeqCst), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_completion_callbacks_and_batches() {
    let manager = TaskManager::new(test_config());

    let batches: Arc<Mutex<Vec<Vec<TaskCompletionInfo>>>> = Arc::default();
    let recorder = Arc::clone(&batches);
    manager.add_batch_completion_callback(move |batch| recorder.lock().push(batch.to_vec()));

    let seen_by_task = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen_by_task);
    let task = CompositeTask::builder("observed", "Observed")
        .sub_task_with(
            FnSubTask::builder("work", "Work")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::with_data(true)) }),
        )
        .on_complete(move |result| {
            assert!(result.success);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    manager.add_tasks([task, sleeping_task("other", 5)]);

    wait_for("both completions to be delivered", || {
        batches.lock().iter().map(Vec::len).sum::<usize>() == 2
    })
    .await;

    assert_eq!(seen_by_task.load(Ordering::SeqCst), 1);
    let delivered: Vec<TaskCompletionInfo> = batches.lock().concat();
    let observed = delivered
        .iter()
        .find(|info| info.task_id == "observed")
        .expect("Completion for observed task");
    assert_eq!(observed.status, TaskStatus::Completed);
    assert!(observed.all_sub_tasks_successful());
    assert!(batches.lock().iter().all(|batch| !batch.is_empty()));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_progress_events_are_batched_in_order() {
    let manager = TaskManager::new(test_config());
    let events: Arc<Mutex<Vec<TaskProgress>>> = Arc::default();
    let recorder = Arc::clone(&events);
    manager.add_progress_callback(move |progress| recorder.lock().push(progress.clone()));

    let task = CompositeTask::builder("steps", "Steps")
        .sub_task_with(FnSubTask::builder("count", "Count").handler(|_, progress| async move {
            for step in 1..=4 {
                progress.report(f64::from(step) / 4.0, format!("step {}", step));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Ok::<_, TaskError>(SubTaskResult::success())
        }))
        .build()
        .unwrap();
    manager.add_task(task);

    wait_for("terminal progress event", || {
        events
            .lock()
            .iter()
            .any(|event| event.status == TaskStatus::Completed)
    })
    .await;

    let events = events.lock();
    let progress: Vec<f64> = events.iter().map(|event| event.progress).collect();
    assert!(
        progress.windows(2).all(|pair| pair[0] <= pair[1]),
        "Progress should never decrease: {:?}",
        progress
    );
    assert_eq!(events.last().map(|event| event.progress), Some(1.0));

    drop(events);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_task_added_callback_in_submission_order() {
    let manager = TaskManager::new(test_config());
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    manager.add_task_added_callback(move |tasks| {
        recorder
            .lock()
            .extend(tasks.iter().map(|task| task.id().to_string()));
    });

    manager.add_tasks([
        sleeping_task("first", 5),
        sleeping_task("second", 5),
        sleeping_task("first", 5),
    ]);
    assert_eq!(*seen.lock(), vec!["first", "second"]);
    assert_eq!(manager.tasks().len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_tasks_listed_in_submission_order() {
    let manager = TaskManager::new(test_config());

    let built_first = sleeping_task("built-first", 5);
    std::thread::sleep(Duration::from_millis(2));
    let built_second = sleeping_task("built-second", 5);
    assert!(built_first.created_at() < built_second.created_at());

    manager.add_tasks([built_second, built_first]);
    let ids: Vec<String> = manager
        .tasks()
        .iter()
        .map(|task| task.id().to_string())
        .collect();
    assert_eq!(ids, vec!["built-second", "built-first"]);

    let first = manager.task("built-second").unwrap();
    let second = manager.task("built-first").unwrap();
    assert!(first.submission_index() < second.submission_index());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_fixed_delay_requeue_gates_dependents() {
    let manager = TaskManager::new(polling_config());
    let upstream_done = Arc::new(AtomicUsize::new(0));
    let started_early = Arc::new(AtomicUsize::new(0));

    let done = Arc::clone(&upstream_done);
    let upstream = CompositeTask::builder("upstream", "Upstream")
        .sub_task_with(FnSubTask::builder("produce", "Produce").handler(move |_, _| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.store(1, Ordering::SeqCst);
                Ok::<_, TaskError>(SubTaskResult::with_data(5i64))
            }
        }))
        .build()
        .unwrap();

    let done = Arc::clone(&upstream_done);
    let early = Arc::clone(&started_early);
    let downstream = CompositeTask::builder("downstream", "Downstream")
        .depends_on(["upstream"])
        .sub_task_with(FnSubTask::builder("consume", "Consume").handler(move |context, _| {
            let done = Arc::clone(&done);
            let early = Arc::clone(&early);
            async move {
                if done.load(Ordering::SeqCst) == 0 || context.dependency_result("upstream").is_none() {
                    early.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, TaskError>(SubTaskResult::success())
            }
        }))
        .build()
        .unwrap();

    manager.add_tasks([downstream, upstream]);

    // Several requeue periods pass while the dependency is still running
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(manager.task_status("downstream"), Some(TaskStatus::Pending));

    wait_for_result(&manager, "downstream", TaskStatus::Completed).await;
    assert_eq!(started_early.load(Ordering::SeqCst), 0);
    assert!(manager.task_result("upstream").is_some_and(|result| result.success));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_fixed_delay_requeue_waits_for_paused_dependency() {
    let manager = TaskManager::new(polling_config());

    let upstream = CompositeTask::builder("upstream", "Upstream")
        .sub_task_with(
            FnSubTask::builder("steps", "Steps")
                .pausable()
                .handler(|context, progress| async move {
                    for step in 1..=40u32 {
                        context.check_pause_and_wait().await?;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        progress.report(f64::from(step) / 40.0, "step");
                    }
                    Ok::<_, TaskError>(SubTaskResult::success())
                }),
        )
        .build()
        .unwrap();
    let downstream = CompositeTask::builder("downstream", "Downstream")
        .depends_on(["upstream"])
        .sub_task_with(
            FnSubTask::builder("noop", "Noop")
                .handler(|_, _| async { Ok::<_, TaskError>(SubTaskResult::success()) }),
        )
        .build()
        .unwrap();
    manager.add_tasks([upstream, downstream]);

    wait_for("upstream to make progress", || {
        manager
            .task("upstream")
            .is_some_and(|task| task.supports_pause() && task.progress() > 0.1)
    })
    .await;
    manager.pause_task("upstream").expect("Pause should be accepted");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.task_status("upstream"), Some(TaskStatus::Paused));
    assert_eq!(manager.task_status("downstream"), Some(TaskStatus::Pending));
    assert!(manager.task_result("downstream").is_none());

    manager.resume_task("upstream").expect("Resume should be accepted");
    wait_for_result(&manager, "upstream", TaskStatus::Completed).await;
    wait_for_result(&manager, "downstream", TaskStatus::Completed).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_rejects_new_work() {
    let manager = TaskManager::new(test_config());
    let long = CompositeTask::builder("long", "Long")
        .sub_task_with(FnSubTask::builder("wait", "Wait").handler(|context, _| async move {
            tokio::select! {
                _ = context.cancellation_token().cancelled() => Err(TaskError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(SubTaskResult::success()),
            }
        }))
        .build()
        .unwrap();
    manager.add_task(long);

    wait_for("task to start", || {
        manager.task_status("long") == Some(TaskStatus::Running)
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("Shutdown should not wait for the full sleep");

    assert!(manager.is_shut_down());
    assert_eq!(manager.task_status("long"), Some(TaskStatus::Cancelled));
    assert!(!manager.add_task(sleeping_task("late", 1)));
    assert_eq!(manager.scheduler().active_count(), 0);

    // Second shutdown is a no-op
    manager.shutdown().await;
}
