use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Result type returned by task bodies and post-swap hooks.
pub type TaskResult<T = ()> = anyhow::Result<T, anyhow::Error>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to '{0}' failed:\n{1}")]
    Network(String, anyhow::Error),

    #[error("Request to '{0}' returned status {1}")]
    Status(String, u16),

    #[error("Request to '{0}' timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Request to '{0}' was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task '{0}' is already registered")]
    Duplicate(String),

    #[error("Task '{0}' depends on unknown task '{1}'")]
    UnknownDependency(String, String),

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),

    #[error("Task '{0}' failed after {1} attempt(s):\n{2}")]
    TaskFailed(String, u32, anyhow::Error),

    #[error("Queue exceeded its timeout of {0:?}")]
    QueueTimeout(Duration),

    #[error("Queue was cancelled")]
    Cancelled,

    #[error("Queue is already executing")]
    AlreadyRunning,
}

impl SchedulerError {
    /// Configuration errors are reported before any task runs and are never
    /// worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SchedulerError::Duplicate(_)
                | SchedulerError::UnknownDependency(..)
                | SchedulerError::Cycle(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum AnimationError {
    #[error("Animation '{0}' rejected, another animation is in flight")]
    Busy(String),

    #[error("Animation '{0}' failed:\n{1}")]
    Execution(String, anyhow::Error),
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("Couldn't fetch '{0}'")]
    Fetch(String),

    #[error("Content swap failed:\n{0}")]
    Swap(anyhow::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid route pattern '{0}'.\n{1}")]
    Pattern(String, glob::PatternError),

    #[error("Invalid selector '{0}': {1}")]
    Selector(String, String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Animation(#[from] AnimationError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Page layout failed:\n{0}")]
    Layout(anyhow::Error),

    #[error("Lock wait timed out after {0:?}")]
    LockTimeout(Duration),

    #[error("Hook '{0}':\n{1}")]
    Hook(String, anyhow::Error),
}

/// How bad a reported failure is for the page as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    /// The component recovered on its own, nothing visible happened.
    Recoverable,
    /// The page keeps working without some guarantee (animation, warm cache,
    /// settle detection).
    Degraded,
    /// Navigation itself cannot proceed, the caller falls back to a full load.
    Fatal,
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Fetch(FetchError::Cancelled(_)) => Severity::Recoverable,
            EngineError::Fetch(_) => Severity::Degraded,
            EngineError::Layout(_) => Severity::Recoverable,
            EngineError::Hook(..) => Severity::Recoverable,
            EngineError::LockTimeout(_) => Severity::Degraded,
            EngineError::Animation(AnimationError::Busy(_)) => Severity::Recoverable,
            EngineError::Animation(_) => Severity::Degraded,
            EngineError::Scheduler(SchedulerError::Cancelled) => Severity::Recoverable,
            EngineError::Scheduler(err) if err.is_configuration() => Severity::Fatal,
            EngineError::Scheduler(_) => Severity::Degraded,
            EngineError::Navigation(NavigationError::Scheduler(err)) if !err.is_configuration() => {
                Severity::Degraded
            }
            EngineError::Navigation(_) => Severity::Fatal,
            EngineError::Config(_) => Severity::Fatal,
        }
    }
}

/// The single boundary every component failure is funnelled through.
///
/// Reporting never panics and never propagates, it classifies the error,
/// logs it and keeps a tally per severity for the debug panel.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    recoverable: AtomicU64,
    degraded: AtomicU64,
    fatal: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ErrorCounts {
    pub recoverable: u64,
    pub degraded: u64,
    pub fatal: u64,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, err: impl Into<EngineError>) -> Severity {
        let err = err.into();
        let severity = err.severity();

        match severity {
            Severity::Recoverable => {
                self.recoverable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%err, "recoverable failure");
            }
            Severity::Degraded => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "degraded");
            }
            Severity::Fatal => {
                self.fatal.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%err, "fatal failure");
            }
        }

        severity
    }

    pub fn counts(&self) -> ErrorCounts {
        ErrorCounts {
            recoverable: self.recoverable.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        let cycle = EngineError::from(SchedulerError::Cycle("a".into()));
        assert_eq!(cycle.severity(), Severity::Fatal);

        let failed = EngineError::from(SchedulerError::TaskFailed(
            "a".into(),
            1,
            anyhow::anyhow!("boom"),
        ));
        assert_eq!(failed.severity(), Severity::Degraded);

        let busy = EngineError::from(AnimationError::Busy("enter".into()));
        assert_eq!(busy.severity(), Severity::Recoverable);

        let fetch = EngineError::from(NavigationError::Fetch("/a".into()));
        assert_eq!(fetch.severity(), Severity::Fatal);
    }

    #[test]
    fn test_reporter_counts() {
        let reporter = ErrorReporter::new();
        reporter.report(FetchError::Cancelled("/a".into()));
        reporter.report(EngineError::LockTimeout(Duration::from_millis(10)));
        reporter.report(ConfigError::Pattern(
            "[".into(),
            glob::Pattern::new("[").unwrap_err(),
        ));

        assert_eq!(
            reporter.counts(),
            ErrorCounts {
                recoverable: 1,
                degraded: 1,
                fatal: 1,
            }
        );
    }
}
