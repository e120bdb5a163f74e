use crate::task::context::TaskExecutionContext;
use crate::task::error::{BuildError, TaskError};
use crate::task::lock::ResourceLock;
use crate::task::result::SubTaskResult;
use crate::task::types::{SubTaskId, SubTaskProgress, TaskId, TaskStatus};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Callback invoked with a sub-task's result right after it returns
pub type SubTaskCallback = Arc<dyn Fn(&SubTaskResult) + Send + Sync>;

type SubTaskHandler = Arc<
    dyn Fn(TaskExecutionContext, ProgressReporter) -> BoxFuture<'static, Result<SubTaskResult, TaskError>>
        + Send
        + Sync,
>;

/// The smallest executable unit inside a composite task.
///
/// Implementations hold no per-run state; everything they need travels in the
/// [`TaskExecutionContext`]. Long-running work should call
/// [`TaskExecutionContext::check_pause_and_wait`] (or poll
/// [`TaskExecutionContext::should_stop`]) between steps.
#[async_trait::async_trait]
pub trait SubTask: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Named resource this sub-task must hold a permit for while executing
    fn resource_lock(&self) -> Option<&ResourceLock> {
        None
    }

    /// Whether the owning task may be paused while this sub-task runs
    fn supports_pause(&self) -> bool {
        false
    }

    fn on_complete(&self, _result: &SubTaskResult) {}

    async fn execute(
        &self,
        context: &TaskExecutionContext,
        progress: &ProgressReporter,
    ) -> Result<SubTaskResult, TaskError>;
}

/// Handle a sub-task uses to publish progress snapshots
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    sub_task_id: SubTaskId,
    sub_task_name: String,
    sink: Arc<dyn Fn(SubTaskProgress) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(
        task_id: impl Into<TaskId>,
        sub_task_id: impl Into<SubTaskId>,
        sub_task_name: impl Into<String>,
        sink: Arc<dyn Fn(SubTaskProgress) + Send + Sync>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            sub_task_id: sub_task_id.into(),
            sub_task_name: sub_task_name.into(),
            sink,
        }
    }

    /// Report fractional progress (0.0 to 1.0) of this sub-task
    pub fn report(&self, progress: f64, message: impl Into<String>) {
        (self.sink)(SubTaskProgress {
            task_id: self.task_id.clone(),
            sub_task_id: self.sub_task_id.clone(),
            sub_task_name: self.sub_task_name.clone(),
            status: TaskStatus::Running,
            progress,
            message: message.into(),
        });
    }
}

/// Sub-task backed by an async closure
pub struct FnSubTask {
    id: SubTaskId,
    name: String,
    resource_lock: Option<ResourceLock>,
    supports_pause: bool,
    on_complete: Option<SubTaskCallback>,
    handler: SubTaskHandler,
}

impl FnSubTask {
    pub fn builder(id: impl Into<SubTaskId>, name: impl Into<String>) -> SubTaskBuilder {
        SubTaskBuilder::new(id, name)
    }
}

#[async_trait::async_trait]
impl SubTask for FnSubTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_lock(&self) -> Option<&ResourceLock> {
        self.resource_lock.as_ref()
    }

    fn supports_pause(&self) -> bool {
        self.supports_pause
    }

    fn on_complete(&self, result: &SubTaskResult) {
        if let Some(callback) = &self.on_complete {
            callback(result);
        }
    }

    async fn execute(
        &self,
        context: &TaskExecutionContext,
        progress: &ProgressReporter,
    ) -> Result<SubTaskResult, TaskError> {
        (self.handler)(context.clone(), progress.clone()).await
    }
}

/// Builder for [`FnSubTask`]; validated on [`SubTaskBuilder::build`]
pub struct SubTaskBuilder {
    id: SubTaskId,
    name: String,
    resource_lock: Option<ResourceLock>,
    supports_pause: bool,
    on_complete: Option<SubTaskCallback>,
    handler: Option<SubTaskHandler>,
}

impl SubTaskBuilder {
    pub fn new(id: impl Into<SubTaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            resource_lock: None,
            supports_pause: false,
            on_complete: None,
            handler: None,
        }
    }

    pub fn resource_lock(mut self, key: impl Into<String>, permits: usize) -> Self {
        self.resource_lock = Some(ResourceLock::new(key, permits));
        self
    }

    pub fn supports_pause(mut self, supports_pause: bool) -> Self {
        self.supports_pause = supports_pause;
        self
    }

    pub fn pausable(self) -> Self {
        self.supports_pause(true)
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SubTaskResult) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskExecutionContext, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SubTaskResult, TaskError>> + Send + 'static,
    {
        let handler: SubTaskHandler = Arc::new(
            move |context: TaskExecutionContext,
                  progress: ProgressReporter|
                  -> BoxFuture<'static, Result<SubTaskResult, TaskError>> {
                Box::pin(f(context, progress))
            },
        );
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<FnSubTask, BuildError> {
        let handler = self
            .handler
            .ok_or_else(|| BuildError::MissingHandler(self.id.clone()))?;

        if let Some(lock) = &self.resource_lock {
            lock.validate()?;
        }

        Ok(FnSubTask {
            id: self.id,
            name: self.name,
            resource_lock: self.resource_lock,
            supports_pause: self.supports_pause,
            on_complete: self.on_complete,
            handler,
        })
    }
}
