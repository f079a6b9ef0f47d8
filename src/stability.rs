//! Best-effort detection of a settled page.
//!
//! The host forwards what its performance observers report (layout shifts,
//! paints, long tasks) through [`StabilityMonitor::record`]. The monitor adds
//! a frame-rate sampler of its own driven by the host's [`FrameClock`]. Every
//! signal costs the page some points of a 0-100 score, and a run of quiet
//! sampling intervals is taken as "the page has settled". Nothing here proves
//! rendering is complete, it only makes jank during a transition less likely.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::StabilityConfig;
use crate::host::FrameClock;

/// One observed performance event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Signal {
    /// Cumulative-layout-shift entry with its shift value.
    LayoutShift { value: f64 },
    Paint { contentful: bool },
    LongTask { duration: Duration },
    /// A frame-rate sample below the configured threshold.
    LowFrameRate { fps: f64 },
}

impl Signal {
    /// Score points this signal costs.
    pub fn penalty(&self) -> f64 {
        match *self {
            // 5 for a barely visible shift, up to 10 at 0.25 and beyond
            Signal::LayoutShift { value } => 5.0 + 5.0 * (value / 0.25).clamp(0.0, 1.0),
            Signal::Paint { contentful } => {
                if contentful {
                    2.0
                } else {
                    1.0
                }
            }
            // 10 at the 50 ms long-task floor, up to 20 at 300 ms
            Signal::LongTask { duration } => {
                let over = duration.as_secs_f64() * 1000.0 - 50.0;
                10.0 + 10.0 * (over / 250.0).clamp(0.0, 1.0)
            }
            Signal::LowFrameRate { .. } => 5.0,
        }
    }

    /// Whether the signal breaks a silent window. Paints are expected while a
    /// page settles and only lower the score.
    pub fn is_disruptive(&self) -> bool {
        !matches!(self, Signal::Paint { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Penalties {
    pub layout_shift: f64,
    pub paint: f64,
    pub long_task: f64,
    pub frame_rate: f64,
}

impl Penalties {
    pub fn total(&self) -> f64 {
        self.layout_shift + self.paint + self.long_task + self.frame_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilityMetrics {
    pub layout_shifts: u32,
    pub repaints: u32,
    pub long_tasks: u32,
    pub low_frame_samples: u32,
    pub penalties: Penalties,
    pub total_score: f64,
    /// Consecutive silent windows counted by the last wait.
    pub silent_windows: u32,
    pub elapsed: Duration,
    /// The wait ended on its timeout rather than on enough silent windows.
    pub timed_out: bool,
}

impl Default for StabilityMetrics {
    fn default() -> Self {
        Self {
            layout_shifts: 0,
            repaints: 0,
            long_tasks: 0,
            low_frame_samples: 0,
            penalties: Penalties::default(),
            total_score: 100.0,
            silent_windows: 0,
            elapsed: Duration::ZERO,
            timed_out: false,
        }
    }
}

#[derive(Debug)]
struct State {
    monitoring: bool,
    metrics: StabilityMetrics,
    session: Instant,
    last_disruption: Option<Instant>,
    disruptions: u64,
}

impl State {
    fn new() -> Self {
        Self {
            monitoring: false,
            metrics: StabilityMetrics::default(),
            session: Instant::now(),
            last_disruption: None,
            disruptions: 0,
        }
    }

    fn reset(&mut self) {
        self.metrics = StabilityMetrics::default();
        self.session = Instant::now();
        self.last_disruption = None;
        self.disruptions = 0;
    }

    fn snapshot(&self) -> StabilityMetrics {
        StabilityMetrics {
            elapsed: self.session.elapsed(),
            ..self.metrics
        }
    }
}

pub struct StabilityMonitor {
    config: StabilityConfig,
    frames: Arc<dyn FrameClock>,
    state: Mutex<State>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityMonitor")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl StabilityMonitor {
    pub fn new(config: StabilityConfig, frames: Arc<dyn FrameClock>) -> Self {
        Self {
            config,
            frames,
            state: Mutex::new(State::new()),
            sampler: Mutex::new(None),
        }
    }

    /// Starts a monitoring session: counters are reset, signals are accepted
    /// and the frame-rate sampler is spawned. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.monitoring {
                return;
            }
            state.monitoring = true;
            state.reset();
        }

        let monitor = Arc::downgrade(self);
        let frames = self.frames.clone();
        let window = self.config.fps_window;
        let threshold = self.config.low_fps_threshold;

        let handle = tokio::spawn(sample_frame_rate(monitor, frames, window, threshold));
        *self.sampler.lock().unwrap() = Some(handle);

        tracing::debug!("stability monitoring started");
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().monitoring = false;
        if let Some(handle) = self.sampler.lock().unwrap().take() {
            handle.abort();
        }
        tracing::debug!("stability monitoring stopped");
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    pub fn is_monitoring(&self) -> bool {
        self.state.lock().unwrap().monitoring
    }

    /// Feeds one observed signal. Ignored while no session is running.
    pub fn record(&self, signal: Signal) {
        let mut state = self.state.lock().unwrap();
        if !state.monitoring {
            return;
        }

        let penalty = signal.penalty();
        let metrics = &mut state.metrics;
        match signal {
            Signal::LayoutShift { .. } => {
                metrics.layout_shifts += 1;
                metrics.penalties.layout_shift += penalty;
            }
            Signal::Paint { .. } => {
                metrics.repaints += 1;
                metrics.penalties.paint += penalty;
            }
            Signal::LongTask { .. } => {
                metrics.long_tasks += 1;
                metrics.penalties.long_task += penalty;
            }
            Signal::LowFrameRate { .. } => {
                metrics.low_frame_samples += 1;
                metrics.penalties.frame_rate += penalty;
            }
        }
        metrics.total_score = (100.0 - metrics.penalties.total()).clamp(0.0, 100.0);

        if signal.is_disruptive() {
            state.last_disruption = Some(Instant::now());
            state.disruptions += 1;
        }

        tracing::trace!(?signal, penalty, "stability signal");
    }

    pub fn get_score(&self) -> f64 {
        self.state.lock().unwrap().metrics.total_score
    }

    pub fn metrics(&self) -> StabilityMetrics {
        self.state.lock().unwrap().snapshot()
    }

    /// Resets the counters, then samples every `sample_interval` until enough
    /// consecutive silent windows were seen or `timeout` passes. Always
    /// resolves, the timeout is mandatory.
    pub async fn wait_for_stability(&self, timeout: Duration) -> StabilityMetrics {
        let started = Instant::now();
        let deadline = started + timeout;

        let mut seen = {
            let mut state = self.state.lock().unwrap();
            state.monitoring = true;
            state.reset();
            state.disruptions
        };

        let required = self.config.required_windows;
        let mut silent = 0;

        if required == 0 {
            return self.finish(silent, false);
        }

        let interval = self.config.sample_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("page did not settle within {timeout:?}, proceeding");
                    return self.finish(silent, true);
                }
            }

            let (disruptions, last) = {
                let state = self.state.lock().unwrap();
                (state.disruptions, state.last_disruption)
            };

            if disruptions != seen {
                seen = disruptions;
                silent = 0;
            } else if last.is_none_or(|at| at.elapsed() >= self.config.silent_window) {
                silent += 1;
            }

            if silent >= required {
                return self.finish(silent, false);
            }
        }
    }

    fn finish(&self, silent_windows: u32, timed_out: bool) -> StabilityMetrics {
        let mut state = self.state.lock().unwrap();
        state.metrics.silent_windows = silent_windows;
        state.metrics.timed_out = timed_out;

        let metrics = state.snapshot();
        tracing::debug!(
            "settled after {:.2?} with score {:.0}{}",
            metrics.elapsed,
            metrics.total_score,
            if timed_out { " (timeout)" } else { "" }
        );
        metrics
    }
}

impl Drop for StabilityMonitor {
    fn drop(&mut self) {
        if let Ok(mut sampler) = self.sampler.lock()
            && let Some(handle) = sampler.take()
        {
            handle.abort();
        }
    }
}

/// Counts animation frames over fixed windows and reports the windows below
/// `threshold` frames per second.
async fn sample_frame_rate(
    monitor: Weak<StabilityMonitor>,
    frames: Arc<dyn FrameClock>,
    window: Duration,
    threshold: f64,
) {
    let window = window.max(Duration::from_millis(1));

    loop {
        let started = Instant::now();
        let mut count = 0u32;

        while started.elapsed() < window {
            frames.next_frame().await;
            count += 1;
        }

        let Some(monitor) = monitor.upgrade() else {
            return;
        };

        let fps = f64::from(count) / started.elapsed().as_secs_f64();
        if fps < threshold {
            monitor.record(Signal::LowFrameRate { fps });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TokioFrames;

    fn monitor(frame: Duration) -> Arc<StabilityMonitor> {
        Arc::new(StabilityMonitor::new(
            StabilityConfig::default(),
            Arc::new(TokioFrames { frame }),
        ))
    }

    fn smooth() -> Arc<StabilityMonitor> {
        monitor(Duration::from_micros(16_667))
    }

    fn assert_near(elapsed: Duration, millis: u64) {
        let expected = Duration::from_millis(millis);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "resolved after {elapsed:?}, expected {expected:?}"
        );
    }

    #[test]
    fn test_penalties() {
        assert_eq!(Signal::LayoutShift { value: 0.0 }.penalty(), 5.0);
        assert_eq!(Signal::LayoutShift { value: 1.0 }.penalty(), 10.0);
        assert_eq!(Signal::Paint { contentful: false }.penalty(), 1.0);
        assert_eq!(Signal::Paint { contentful: true }.penalty(), 2.0);

        let short = Signal::LongTask {
            duration: Duration::from_millis(50),
        };
        let long = Signal::LongTask {
            duration: Duration::from_millis(800),
        };
        assert_eq!(short.penalty(), 10.0);
        assert_eq!(long.penalty(), 20.0);
        assert_eq!(Signal::LowFrameRate { fps: 12.0 }.penalty(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_page_settles_after_required_windows() {
        let monitor = smooth();
        monitor.start();

        let started = Instant::now();
        let metrics = monitor.wait_for_stability(Duration::from_secs(3)).await;

        assert_near(started.elapsed(), 300);
        assert!(!metrics.timed_out);
        assert_eq!(metrics.silent_windows, 3);
        assert_eq!(metrics.total_score, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_timeout_is_flagged() {
        let monitor = smooth();
        monitor.start();

        let started = Instant::now();
        let metrics = monitor.wait_for_stability(Duration::from_millis(250)).await;

        assert_near(started.elapsed(), 250);
        assert!(metrics.timed_out);
        assert_eq!(metrics.silent_windows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disruption_resets_silent_count() {
        let monitor = smooth();
        monitor.start();

        tokio::spawn({
            let monitor = monitor.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                monitor.record(Signal::LayoutShift { value: 0.1 });
            }
        });

        let started = Instant::now();
        let metrics = monitor.wait_for_stability(Duration::from_secs(3)).await;

        assert_near(started.elapsed(), 500);
        assert_eq!(metrics.layout_shifts, 1);
        assert_eq!(metrics.total_score, 93.0);
        assert!(!metrics.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paint_does_not_break_silence() {
        let monitor = smooth();
        monitor.start();

        tokio::spawn({
            let monitor = monitor.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                monitor.record(Signal::Paint { contentful: true });
            }
        });

        let started = Instant::now();
        let metrics = monitor.wait_for_stability(Duration::from_secs(3)).await;

        assert_near(started.elapsed(), 300);
        assert_eq!(metrics.repaints, 1);
        assert_eq!(metrics.total_score, 98.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_score_is_clamped() {
        let monitor = smooth();
        monitor.start();

        for _ in 0..10 {
            monitor.record(Signal::LongTask {
                duration: Duration::from_millis(400),
            });
        }

        assert_eq!(monitor.get_score(), 0.0);
        assert_eq!(monitor.metrics().long_tasks, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_ignored_when_stopped() {
        let monitor = smooth();
        monitor.record(Signal::LayoutShift { value: 1.0 });
        assert_eq!(monitor.get_score(), 100.0);

        monitor.start();
        monitor.record(Signal::LayoutShift { value: 1.0 });
        monitor.stop();
        monitor.record(Signal::LayoutShift { value: 1.0 });

        assert_eq!(monitor.get_score(), 90.0);
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_frame_rate_is_sampled() {
        // 20 fps
        let monitor = monitor(Duration::from_millis(50));
        monitor.start();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let metrics = monitor.metrics();
        assert!(metrics.low_frame_samples >= 2);
        assert_eq!(metrics.penalties.frame_rate, 5.0 * metrics.low_frame_samples as f64);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_smooth_frames_are_not_penalised() {
        let monitor = smooth();
        monitor.start();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(monitor.metrics().low_frame_samples, 0);
    }
}
