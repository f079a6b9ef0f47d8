use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskResult;

/// Highest priority a task can carry.
pub const MAX_PRIORITY: u8 = 10;

/// What a task body gets to see about its own execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: Arc<str>,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
    /// Fires when the queue is cancelled. Bodies are expected to check it at
    /// their own safe points, the queue never interrupts them.
    pub cancel: CancellationToken,
}

pub(crate) type TaskWork = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// A unit of work waiting to be registered into a [`TaskQueue`](super::TaskQueue).
#[derive(Clone)]
pub struct TaskSpec {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) priority: u8,
    pub(crate) depends_on: BTreeSet<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) skip_on_error: bool,
    pub(crate) work: TaskWork,
}

impl TaskSpec {
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            priority: 5,
            depends_on: BTreeSet::new(),
            timeout: None,
            max_retries: None,
            skip_on_error: false,
            work: Arc::new(move |ctx| work(ctx).boxed()),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Priority between 0 and 10, higher runs first among tasks whose
    /// dependencies are met.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Per-attempt timeout, the queue default applies when unset.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Marks the task skipped instead of aborting the queue once its retries
    /// run out.
    pub fn skip_on_error(mut self) -> Self {
        self.skip_on_error = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .field("skip_on_error", &self.skip_on_error)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Executing)
    }

    /// Whether dependents of a task in this state may run.
    pub(crate) fn satisfies_dependents(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// A registered task, owned by its queue.
pub(crate) struct Task {
    pub(crate) spec: TaskSpec,
    pub(crate) state: TaskState,
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retries_remaining: u32,
    pub(crate) attempts: u32,
    pub(crate) started: Option<Instant>,
    pub(crate) duration: Option<Duration>,
    pub(crate) error: Option<String>,
}

impl Task {
    pub(crate) fn new(spec: TaskSpec, default_timeout: Duration, default_retries: u32) -> Self {
        let max_retries = spec.max_retries.unwrap_or(default_retries);
        Self {
            timeout: spec.timeout.unwrap_or(default_timeout),
            max_retries,
            retries_remaining: max_retries,
            state: TaskState::Pending,
            attempts: 0,
            started: None,
            duration: None,
            error: None,
            spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = TaskSpec::new("toc", |_| async { Ok(()) })
            .name("Rebuild table of contents")
            .priority(42)
            .depends_on("highlight")
            .depends_on("highlight")
            .retries(2)
            .skip_on_error();

        assert_eq!(spec.id(), "toc");
        assert_eq!(spec.priority, MAX_PRIORITY);
        assert_eq!(spec.depends_on.len(), 1);
        assert!(spec.skip_on_error);

        let task = Task::new(spec, Duration::from_secs(5), 0);
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.retries_remaining, 2);
        assert_eq!(task.timeout, Duration::from_secs(5));
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_state_predicates() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Executing.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(TaskState::Skipped.satisfies_dependents());
        assert!(!TaskState::Cancelled.satisfies_dependents());
    }
}
