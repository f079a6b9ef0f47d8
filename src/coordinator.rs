//! Sequences the preparation of one navigation into four phases.
//!
//! 1. **Preload**: the target page comes out of (or goes into) the preload
//!    cache.
//! 2. **Initialize**: the post-swap task queue runs.
//! 3. **Stabilize**: the stability monitor waits for the page to settle.
//! 4. **Release**: the gate reason held for the navigation is lowered, which
//!    lets any queued animation through.
//!
//! Each phase is timed and the finished runs are kept in a bounded history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::config::CoordinatorConfig;
use crate::error::SchedulerError;
use crate::gatekeeper::TransitionGatekeeper;
use crate::preload::{PagePreloader, PreloadEntry};
use crate::scheduler::{QueueOutcome, TaskQueue};
use crate::stability::{StabilityMetrics, StabilityMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Preload,
    Initialize,
    Stabilize,
    Release,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preload => "preload",
            Phase::Initialize => "initialize",
            Phase::Stabilize => "stabilize",
            Phase::Release => "release",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMetrics {
    pub phase: Phase,
    pub duration: Duration,
    pub success: bool,
    pub detail: Option<String>,
}

/// One navigation going through the phases.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorRun {
    pub id: u64,
    pub url: Url,
    pub phases: Vec<PhaseMetrics>,
    pub stability: Option<StabilityMetrics>,
    pub duration: Duration,
    #[serde(skip)]
    started: Option<Instant>,
}

impl CoordinatorRun {
    /// A run succeeds when every phase it went through did.
    pub fn success(&self) -> bool {
        self.phases.iter().all(|phase| phase.success)
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseMetrics> {
        self.phases.iter().find(|metrics| metrics.phase == phase)
    }

    fn record(&mut self, phase: Phase, started: Instant, success: bool, detail: Option<String>) {
        let duration = started.elapsed();
        tracing::debug!(
            "run #{} {} finished in {duration:.2?}{}",
            self.id,
            phase.as_str(),
            if success { "" } else { " (failed)" }
        );
        self.phases.push(PhaseMetrics {
            phase,
            duration,
            success,
            detail,
        });
    }
}

pub struct PreloadCoordinator {
    config: CoordinatorConfig,
    preloader: Arc<PagePreloader>,
    queue: Arc<TaskQueue>,
    monitor: Arc<StabilityMonitor>,
    gate: Arc<TransitionGatekeeper>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<CoordinatorRun>>,
}

impl std::fmt::Debug for PreloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreloadCoordinator")
            .field("config", &self.config)
            .field("runs", &self.history.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl PreloadCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        preloader: Arc<PagePreloader>,
        queue: Arc<TaskQueue>,
        monitor: Arc<StabilityMonitor>,
        gate: Arc<TransitionGatekeeper>,
    ) -> Self {
        Self {
            config,
            preloader,
            queue,
            monitor,
            gate,
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn begin(&self, url: &Url) -> CoordinatorRun {
        CoordinatorRun {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            url: url.clone(),
            phases: Vec::with_capacity(4),
            stability: None,
            duration: Duration::ZERO,
            started: Some(Instant::now()),
        }
    }

    /// Preload phase. Fails only when the page could not be fetched.
    pub async fn prepare(&self, run: &mut CoordinatorRun) -> Option<PreloadEntry> {
        let started = Instant::now();
        let entry = self.preloader.preload(&run.url).await;

        let detail = entry
            .as_ref()
            .map(|entry| format!("{} resources", entry.resources.len()));
        run.record(Phase::Preload, started, entry.is_some(), detail);

        entry
    }

    /// Initialize phase, runs whatever is registered in the task queue.
    pub async fn initialize(
        &self,
        run: &mut CoordinatorRun,
    ) -> Result<QueueOutcome, SchedulerError> {
        let started = Instant::now();
        let result = self.queue.execute().await;

        let detail = match &result {
            Ok(outcome) => format!("{} completed, {} skipped", outcome.completed, outcome.skipped),
            Err(err) => err.to_string(),
        };
        run.record(Phase::Initialize, started, result.is_ok(), Some(detail));

        result
    }

    /// Stabilize phase, always resolves. A timeout-induced settle counts as
    /// a failed phase.
    pub async fn stabilize(&self, run: &mut CoordinatorRun) -> StabilityMetrics {
        let started = Instant::now();
        let metrics = self
            .monitor
            .wait_for_stability(self.monitor.config().timeout)
            .await;

        let detail = format!("score {:.0}", metrics.total_score);
        run.record(Phase::Stabilize, started, !metrics.timed_out, Some(detail));
        run.stability = Some(metrics);

        metrics
    }

    /// Release phase, lowers `reason` on the gate.
    pub fn release(&self, run: &mut CoordinatorRun, reason: &str) {
        let started = Instant::now();
        self.gate.unlock(Some(reason));
        run.record(Phase::Release, started, true, None);
    }

    /// Closes the run and files it into the history.
    pub fn finish(&self, mut run: CoordinatorRun) -> CoordinatorRun {
        if let Some(started) = run.started.take() {
            run.duration = started.elapsed();
        }

        tracing::debug!(
            "run #{} for {} {} in {:.2?}",
            run.id,
            run.url,
            if run.success() { "succeeded" } else { "failed" },
            run.duration
        );

        let mut history = self.history.lock().unwrap();
        let capacity = self.config.history_capacity.max(1);
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(run.clone());

        run
    }

    /// All four phases back to back, holding `reason` on the gate until the
    /// page settled.
    pub async fn coordinate(&self, url: &Url, reason: &str) -> CoordinatorRun {
        self.gate.lock(reason);
        let mut run = self.begin(url);

        if self.prepare(&mut run).await.is_some()
            && let Err(err) = self.initialize(&mut run).await
        {
            tracing::warn!("initialization of {url} failed: {err}");
        }

        self.stabilize(&mut run).await;
        self.release(&mut run, reason);
        self.finish(run)
    }

    pub fn history(&self) -> Vec<CoordinatorRun> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// Share of the runs in the history that succeeded, `None` before the
    /// first one.
    pub fn success_rate(&self) -> Option<f64> {
        let history = self.history.lock().unwrap();
        if history.is_empty() {
            return None;
        }
        let succeeded = history.iter().filter(|run| run.success()).count();
        Some(succeeded as f64 / history.len() as f64)
    }

    /// Mean duration of `phase` over the runs that went through it.
    pub fn average(&self, phase: Phase) -> Option<Duration> {
        let history = self.history.lock().unwrap();
        let durations: Vec<_> = history
            .iter()
            .filter_map(|run| run.phase(phase))
            .map(|metrics| metrics.duration)
            .collect();

        if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<Duration>() / durations.len() as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatekeeperConfig, PreloadConfig, SchedulerConfig, StabilityConfig};
    use crate::error::ErrorReporter;
    use crate::host::memory::{MemoryTransitions, RecordingLayout, StaticFetcher};
    use crate::host::{TokioFrames, TokioIdle};
    use crate::scheduler::TaskSpec;

    struct Fixture {
        coordinator: PreloadCoordinator,
        queue: Arc<TaskQueue>,
        gate: Arc<TransitionGatekeeper>,
    }

    fn fixture(history_capacity: usize) -> Fixture {
        let reporter = Arc::new(ErrorReporter::new());
        let frames = Arc::new(TokioFrames::default());
        let fetcher = Arc::new(
            StaticFetcher::new().with_page("https://b.example/archives/1", "<article></article>"),
        );

        let preloader = Arc::new(PagePreloader::new(
            PreloadConfig::default(),
            fetcher,
            Arc::new(RecordingLayout::new()),
            reporter.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(SchedulerConfig::default(), Arc::new(TokioIdle)));
        let monitor = Arc::new(StabilityMonitor::new(
            StabilityConfig::default(),
            frames.clone(),
        ));
        let gate = Arc::new(TransitionGatekeeper::new(
            GatekeeperConfig::default(),
            Arc::new(MemoryTransitions::new(true)),
            frames,
            monitor.clone(),
            queue.clone(),
            reporter,
        ));

        Fixture {
            coordinator: PreloadCoordinator::new(
                CoordinatorConfig { history_capacity },
                preloader,
                queue.clone(),
                monitor,
                gate.clone(),
            ),
            queue,
            gate,
        }
    }

    fn url(path: &str) -> Url {
        Url::parse("https://b.example/").unwrap().join(path).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_phases_in_order() {
        let Fixture {
            coordinator,
            queue,
            gate,
        } = fixture(20);
        queue.add(TaskSpec::new("toc", |_| async { Ok(()) })).unwrap();

        let run = coordinator.coordinate(&url("/archives/1"), "navigating").await;

        let phases: Vec<_> = run.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Preload,
                Phase::Initialize,
                Phase::Stabilize,
                Phase::Release
            ]
        );
        assert!(run.success());
        assert!(!gate.is_locked());
        assert!(run.stability.is_some());
        let settle = run.phase(Phase::Stabilize).unwrap().duration;
        assert!(settle >= Duration::from_millis(300) && settle < Duration::from_millis(310));
        assert_eq!(coordinator.success_rate(), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_preload_still_releases() {
        let Fixture {
            coordinator, gate, ..
        } = fixture(20);

        let run = coordinator.coordinate(&url("/missing"), "navigating").await;

        assert!(!run.success());
        assert!(run.phase(Phase::Initialize).is_none());
        assert!(run.phase(Phase::Release).is_some());
        assert!(!gate.is_locked());
        assert_eq!(coordinator.success_rate(), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let Fixture { coordinator, .. } = fixture(2);
        assert_eq!(coordinator.success_rate(), None);

        for _ in 0..3 {
            coordinator.coordinate(&url("/archives/1"), "navigating").await;
        }

        let ids: Vec<_> = coordinator.history().iter().map(|run| run.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(coordinator.average(Phase::Stabilize).is_some());
        assert!(coordinator.average(Phase::Initialize).is_some());
    }
}
