//! Sequential, dependency-ordered task queue.
//!
//! Tasks registered into a [`TaskQueue`] run strictly one at a time. Before
//! anything runs the dependency graph is sorted topologically, a cycle aborts
//! the whole execution up front. Among tasks whose dependencies are met, the
//! higher priority goes first, ties are broken by registration order. Each
//! task waits for the host's idle hook before it starts, so a long chain of
//! tasks never blocks input handling for long.

mod diagnostics;
mod task;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};

pub use self::diagnostics::{Diagnostics, TaskExecution, TaskReport, Transition};
pub use self::task::{MAX_PRIORITY, TaskContext, TaskSpec, TaskState};

use self::task::Task;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::host::IdleScheduler;

/// Final tally of a successful [`TaskQueue::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOutcome {
    pub completed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration: Duration,
}

#[derive(Default)]
struct Inner {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    transitions: Vec<Transition>,
}

impl Inner {
    fn set_state(&mut self, index: usize, to: TaskState, origin: Instant) {
        let task = &mut self.tasks[index];
        let from = task.state;
        if from == to {
            return;
        }

        task.state = to;
        tracing::debug!("task '{}': {} -> {}", task.spec.id, from.as_str(), to.as_str());
        self.transitions.push(Transition {
            task: task.spec.id.clone(),
            from,
            to,
            at: origin.elapsed(),
        });
    }

    fn cancel_unfinished(&mut self, origin: Instant) -> usize {
        let unfinished: Vec<_> = (0..self.tasks.len())
            .filter(|&i| !self.tasks[i].state.is_terminal())
            .collect();

        for &index in &unfinished {
            self.set_state(index, TaskState::Cancelled, origin);
        }

        unfinished.len()
    }
}

enum Admission {
    Run,
    /// Already settled by an earlier execution or a cancel.
    Settled,
    /// A dependency ended failed or cancelled.
    Blocked,
}

/// Resets the running flag however `execute` ends, including when its
/// future is dropped.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TaskQueue {
    config: SchedulerConfig,
    idle: Arc<dyn IdleScheduler>,
    created: Instant,
    inner: Mutex<Inner>,
    paused: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("tasks", &self.len())
            .field("running", &self.running.load(Ordering::Acquire))
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl TaskQueue {
    pub fn new(config: SchedulerConfig, idle: Arc<dyn IdleScheduler>) -> Self {
        let (paused, _) = watch::channel(false);

        Self {
            config,
            idle,
            created: Instant::now(),
            inner: Mutex::new(Inner::default()),
            paused,
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Registers a task. Dependencies are only resolved by
    /// [`execute`](Self::execute), so tasks can be added in any order.
    pub fn add(&self, spec: TaskSpec) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Acquire) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains_key(&spec.id) {
            return Err(SchedulerError::Duplicate(spec.id));
        }

        tracing::trace!("registered task '{}'", spec.id);
        let index = inner.tasks.len();
        inner.index.insert(spec.id.clone(), index);
        inner.tasks.push(Task::new(
            spec,
            self.config.task_timeout,
            self.config.max_retries,
        ));

        Ok(())
    }

    /// Runs every pending task in dependency order.
    ///
    /// A task that fails once its retries are spent aborts the queue unless it
    /// was registered with [`TaskSpec::skip_on_error`]. The tasks the queue
    /// never reached stay pending.
    pub async fn execute(&self) -> Result<QueueOutcome, SchedulerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _running = Running(&self.running);

        let order = self.plan().inspect_err(|err| tracing::error!("{err}"))?;

        let token = {
            let mut token = self.cancel.lock().unwrap();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        let started = Instant::now();
        tracing::info!("executing {} task(s)", order.len());

        match tokio::time::timeout(self.config.queue_timeout, self.run(&order, &token)).await {
            Ok(Ok(())) => {
                let outcome = self.outcome(started.elapsed());
                tracing::info!(
                    "queue finished in {:.2?}: {} completed, {} skipped",
                    outcome.duration,
                    outcome.completed,
                    outcome.skipped
                );
                Ok(outcome)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                token.cancel();
                let cancelled = self.inner.lock().unwrap().cancel_unfinished(self.created);
                tracing::warn!(
                    "queue timed out after {:?}, {cancelled} task(s) cancelled",
                    self.config.queue_timeout
                );
                Err(SchedulerError::QueueTimeout(self.config.queue_timeout))
            }
        }
    }

    /// Suspends the execution loop before the next task. The task currently
    /// running is left alone.
    pub fn pause(&self) {
        self.paused.send_replace(true);
        tracing::debug!("queue paused");
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        tracing::debug!("queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Marks every pending or executing task cancelled and fires the
    /// cancellation token handed to task bodies. The loop stops at the next
    /// safe point, a running body is never interrupted.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
        let cancelled = self.inner.lock().unwrap().cancel_unfinished(self.created);
        tracing::info!("queue cancelled, {cancelled} task(s) marked cancelled");
    }

    /// Drops every registered task and the transition log.
    pub fn clear(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Acquire) {
            return Err(SchedulerError::AlreadyRunning);
        }
        *self.inner.lock().unwrap() = Inner::default();
        Ok(())
    }

    /// Whether no execution is in progress.
    pub fn is_idle(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(id).map(|&i| inner.tasks[i].state)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().unwrap().transitions.clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let inner = self.inner.lock().unwrap();

        let tasks = inner
            .tasks
            .iter()
            .map(|task| TaskReport {
                id: task.spec.id.clone(),
                name: task.spec.name.clone(),
                priority: task.spec.priority,
                depends_on: task.spec.depends_on.iter().cloned().collect(),
                state: task.state,
                attempts: task.attempts,
                execution: task.started.map(|start| TaskExecution {
                    start: start.duration_since(self.created),
                    duration: task.duration.unwrap_or_else(|| start.elapsed()),
                }),
                error: task.error.clone(),
            })
            .collect();

        Diagnostics {
            tasks,
            transitions: inner.transitions.clone(),
        }
    }

    /// Execution order: topological, and among ready tasks by descending
    /// priority then registration order.
    fn plan(&self) -> Result<Vec<usize>, SchedulerError> {
        let inner = self.inner.lock().unwrap();

        let mut graph = DiGraph::<usize, ()>::with_capacity(inner.tasks.len(), 0);
        let nodes: Vec<NodeIndex> = (0..inner.tasks.len()).map(|i| graph.add_node(i)).collect();

        for (i, task) in inner.tasks.iter().enumerate() {
            for dep in &task.spec.depends_on {
                let &d = inner.index.get(dep).ok_or_else(|| {
                    SchedulerError::UnknownDependency(task.spec.id.clone(), dep.clone())
                })?;
                graph.add_edge(nodes[d], nodes[i], ());
            }
        }

        // We run toposort primarily to detect any cycles in the graph.
        petgraph::algo::toposort(&graph, None).map_err(|cycle| {
            SchedulerError::Cycle(inner.tasks[graph[cycle.node_id()]].spec.id.clone())
        })?;

        let mut pending: Vec<usize> = nodes
            .iter()
            .map(|&n| {
                graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<(u8, Reverse<usize>)> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| (inner.tasks[i].spec.priority, Reverse(i)))
            .collect();

        let mut order = Vec::with_capacity(inner.tasks.len());
        while let Some((_, Reverse(i))) = ready.pop() {
            order.push(i);
            for next in graph.neighbors_directed(nodes[i], petgraph::Direction::Outgoing) {
                let j = graph[next];
                pending[j] -= 1;
                if pending[j] == 0 {
                    ready.push((inner.tasks[j].spec.priority, Reverse(j)));
                }
            }
        }

        Ok(order)
    }

    async fn run(&self, order: &[usize], token: &CancellationToken) -> Result<(), SchedulerError> {
        let mut paused = self.paused.subscribe();

        for &index in order {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SchedulerError::Cancelled),
                _ = unpaused(&mut paused) => {}
            }

            match self.admit(index) {
                Admission::Run => {}
                Admission::Settled | Admission::Blocked => continue,
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SchedulerError::Cancelled),
                _ = self.idle.idle(self.config.idle_slice) => {}
            }

            self.run_task(index, token).await?;
        }

        if token.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        Ok(())
    }

    fn admit(&self, index: usize) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        let task = &inner.tasks[index];

        if task.state != TaskState::Pending {
            return Admission::Settled;
        }

        let blocked = task
            .spec
            .depends_on
            .iter()
            .filter_map(|dep| inner.index.get(dep))
            .any(|&d| !inner.tasks[d].state.satisfies_dependents());

        if blocked {
            inner.set_state(index, TaskState::Cancelled, self.created);
            Admission::Blocked
        } else {
            Admission::Run
        }
    }

    async fn run_task(&self, index: usize, token: &CancellationToken) -> Result<(), SchedulerError> {
        let (id, work, timeout, max_retries, skip_on_error) = {
            let mut inner = self.inner.lock().unwrap();
            inner.set_state(index, TaskState::Executing, self.created);
            let task = &mut inner.tasks[index];
            task.started = Some(Instant::now());
            (
                Arc::<str>::from(task.spec.id.as_str()),
                task.spec.work.clone(),
                task.timeout,
                task.max_retries,
                task.spec.skip_on_error,
            )
        };

        let span = tracing::span!(Level::DEBUG, "task", id = %id);
        let started = Instant::now();
        let mut attempt = 0;

        let error = loop {
            attempt += 1;

            let context = TaskContext {
                id: id.clone(),
                attempt,
                cancel: token.child_token(),
            };

            // A panicking body is treated like one returning an error.
            let body = AssertUnwindSafe(work(context)).catch_unwind();
            let result = match tokio::time::timeout(timeout, body)
                .instrument(span.clone())
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(anyhow::anyhow!("task panicked")),
                Err(_) => Err(anyhow::anyhow!("timed out after {timeout:?}")),
            };

            {
                let mut inner = self.inner.lock().unwrap();
                let task = &mut inner.tasks[index];
                task.attempts = attempt;
                if result.is_err() {
                    task.retries_remaining = task.retries_remaining.saturating_sub(1);
                }
            }

            match result {
                Ok(()) => break None,
                Err(err) if attempt <= max_retries && !token.is_cancelled() => {
                    tracing::warn!(parent: &span, "task '{id}' attempt {attempt} failed, retrying: {err}");
                }
                Err(err) => break Some(err),
            }
        };

        let mut inner = self.inner.lock().unwrap();
        inner.tasks[index].duration = Some(started.elapsed());

        if inner.tasks[index].state == TaskState::Cancelled {
            return Err(SchedulerError::Cancelled);
        }

        match error {
            None => {
                inner.set_state(index, TaskState::Completed, self.created);
                Ok(())
            }
            Some(err) if skip_on_error => {
                tracing::warn!(parent: &span, "task '{id}' skipped: {err}");
                inner.tasks[index].error = Some(err.to_string());
                inner.set_state(index, TaskState::Skipped, self.created);
                Ok(())
            }
            Some(err) => {
                inner.tasks[index].error = Some(err.to_string());
                inner.set_state(index, TaskState::Failed, self.created);
                Err(SchedulerError::TaskFailed(id.to_string(), attempt, err))
            }
        }
    }

    fn outcome(&self, duration: Duration) -> QueueOutcome {
        let inner = self.inner.lock().unwrap();
        let count = |state| inner.tasks.iter().filter(|t| t.state == state).count();

        QueueOutcome {
            completed: count(TaskState::Completed),
            skipped: count(TaskState::Skipped),
            cancelled: count(TaskState::Cancelled),
            duration,
        }
    }
}

async fn unpaused(paused: &mut watch::Receiver<bool>) {
    // the sender lives as long as the queue
    let _ = paused.wait_for(|paused| !*paused).await.map(|_| ());
}
