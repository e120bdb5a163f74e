use crate::task::composite::{CompositeTask, TaskCompletionCallback};
use crate::task::error::BuildError;
use crate::task::result::TaskResult;
use crate::task::subtask::{SubTask, SubTaskBuilder};
use crate::task::types::TaskId;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Fluent builder for [`CompositeTask`]
pub struct TaskBuilder {
    id: TaskId,
    name: String,
    priority: i32,
    dependencies: Vec<TaskId>,
    sub_tasks: Vec<Arc<dyn SubTask>>,
    on_complete: Option<TaskCompletionCallback>,
    // First error from a deferred sub-task build, reported by `build`
    deferred_error: Option<BuildError>,
}

impl TaskBuilder {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority: 0,
            dependencies: Vec::new(),
            sub_tasks: Vec::new(),
            on_complete: None,
            deferred_error: None,
        }
    }

    /// Builder with a freshly generated UUID as task id
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), name)
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add prerequisite task ids. Duplicates are ignored.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        for dependency in dependencies {
            let dependency = dependency.into();
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    pub fn sub_task(self, sub_task: impl SubTask + 'static) -> Self {
        self.sub_task_arc(Arc::new(sub_task))
    }

    pub fn sub_task_arc(mut self, sub_task: Arc<dyn SubTask>) -> Self {
        self.sub_tasks.push(sub_task);
        self
    }

    /// Build a closure-backed sub-task in place; errors surface from [`TaskBuilder::build`]
    pub fn sub_task_with(self, builder: SubTaskBuilder) -> Self {
        match builder.build() {
            Ok(sub_task) => self.sub_task(sub_task),
            Err(error) => {
                let mut this = self;
                this.deferred_error.get_or_insert(error);
                this
            }
        }
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskResult) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<CompositeTask, BuildError> {
        if let Some(error) = self.deferred_error {
            return Err(error);
        }
        if self.id.trim().is_empty() {
            return Err(BuildError::EmptyId);
        }
        if self.dependencies.contains(&self.id) {
            return Err(BuildError::SelfDependency(self.id));
        }

        let mut seen = HashSet::new();
        for sub_task in &self.sub_tasks {
            if sub_task.id().is_empty() {
                return Err(BuildError::EmptySubTaskId(self.id));
            }
            if !seen.insert(sub_task.id()) {
                return Err(BuildError::DuplicateSubTask {
                    task_id: self.id.clone(),
                    sub_task_id: sub_task.id().to_string(),
                });
            }
            if let Some(lock) = sub_task.resource_lock() {
                lock.validate()?;
            }
        }

        Ok(CompositeTask::new(
            self.id,
            self.name,
            self.sub_tasks,
            self.dependencies,
            self.priority,
            self.on_complete,
        ))
    }
}
