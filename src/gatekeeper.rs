//! The lock every page animation has to get past.
//!
//! Any subsystem can raise a named reason ("navigating", "animating", ...);
//! the gate is locked while at least one reason is raised. Animation requests
//! wait for the gate to open, check that the page is calm enough, then run
//! either the platform view transition or the interpolation fallback. Only
//! one animation is ever in flight, a second request while one runs is
//! rejected outright.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::GatekeeperConfig;
use crate::error::{AnimationError, EngineError, ErrorReporter};
use crate::host::{FrameClock, TransitionHost};
use crate::motion::Motion;
use crate::scheduler::TaskQueue;
use crate::stability::StabilityMonitor;

/// Lock reason held while an animation dispatched by the gate runs.
pub const ANIMATING: &str = "animating";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GateStatus {
    Unlocked,
    Locked,
    /// Locked, with at least one caller blocked in
    /// [`TransitionGatekeeper::wait_for_unlock`].
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnimationMethod {
    /// The platform's view-transition primitive.
    ViewTransition,
    /// Frame-by-frame position/scale interpolation.
    Interpolation,
    /// Neither was available, nothing was animated.
    None,
}

#[derive(Debug, Clone, Default)]
pub struct AnimationRequest {
    pub name: String,
    /// Skips the stability and scheduler admission checks.
    pub force: bool,
    /// What to interpolate when the platform primitive is missing.
    pub motion: Option<Motion>,
}

impl AnimationRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn motion(mut self, motion: Motion) -> Self {
        self.motion = Some(motion);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationOutcome {
    pub name: String,
    pub method: AnimationMethod,
    /// Whether the admission checks passed. `false` means they timed out and
    /// the animation ran anyway.
    pub admitted: bool,
    /// Time spent waiting for the gate and for admission.
    pub waited: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GateEventKind {
    Lock { reason: String },
    Unlock { reason: Option<String> },
    Request { name: String, force: bool },
    Rejected { name: String },
    Dispatched { name: String, method: AnimationMethod },
    Finished { name: String, success: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateEvent {
    /// Offset from the gatekeeper's creation.
    pub at: Duration,
    #[serde(flatten)]
    pub kind: GateEventKind,
}

#[derive(Debug, Default)]
struct State {
    reasons: BTreeSet<String>,
    waiters: usize,
    animating: Option<String>,
    history: VecDeque<GateEvent>,
}

/// Marks an animation in flight until dropped, and releases the
/// [`ANIMATING`] reason if this flight raised it.
struct Flight<'a> {
    gate: &'a TransitionGatekeeper,
    holds_lock: bool,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.holds_lock {
            self.gate.unlock(Some(ANIMATING));
        }
        self.gate.state.lock().unwrap().animating = None;
    }
}

/// Counts a caller blocked on the gate until dropped.
struct Waiter<'a>(&'a Mutex<State>);

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap().waiters -= 1;
    }
}

pub struct TransitionGatekeeper {
    config: GatekeeperConfig,
    transitions: Arc<dyn TransitionHost>,
    frames: Arc<dyn FrameClock>,
    monitor: Arc<StabilityMonitor>,
    queue: Arc<TaskQueue>,
    reporter: Arc<ErrorReporter>,
    created: Instant,
    state: Mutex<State>,
    unlocked: watch::Sender<bool>,
}

impl std::fmt::Debug for TransitionGatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionGatekeeper")
            .field("status", &self.status())
            .field("reasons", &self.reasons())
            .finish_non_exhaustive()
    }
}

impl TransitionGatekeeper {
    pub fn new(
        config: GatekeeperConfig,
        transitions: Arc<dyn TransitionHost>,
        frames: Arc<dyn FrameClock>,
        monitor: Arc<StabilityMonitor>,
        queue: Arc<TaskQueue>,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        let (unlocked, _) = watch::channel(true);

        Self {
            config,
            transitions,
            frames,
            monitor,
            queue,
            reporter,
            created: Instant::now(),
            state: Mutex::new(State::default()),
            unlocked,
        }
    }

    // ******************************
    // *           Lock             *
    // ******************************

    /// Raises `reason`. Raising a reason twice is the same as raising it once.
    pub fn lock(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.reasons.insert(reason.to_string()) {
            return;
        }

        tracing::debug!("gate locked: {reason}");
        self.push_event(
            &mut state,
            GateEventKind::Lock {
                reason: reason.to_string(),
            },
        );
        self.unlocked.send_replace(false);
    }

    /// Lowers `reason`, or every reason at once with `None`.
    pub fn unlock(&self, reason: Option<&str>) {
        let mut state = self.state.lock().unwrap();

        let changed = match reason {
            Some(reason) => state.reasons.remove(reason),
            None => {
                let had = !state.reasons.is_empty();
                state.reasons.clear();
                had
            }
        };

        if !changed {
            return;
        }

        tracing::debug!("gate unlocked: {}", reason.unwrap_or("*"));
        self.push_event(
            &mut state,
            GateEventKind::Unlock {
                reason: reason.map(str::to_string),
            },
        );

        if state.reasons.is_empty() {
            self.unlocked.send_replace(true);
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.state.lock().unwrap().reasons.is_empty()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.state.lock().unwrap().reasons.iter().cloned().collect()
    }

    pub fn status(&self) -> GateStatus {
        let state = self.state.lock().unwrap();
        if state.reasons.is_empty() {
            GateStatus::Unlocked
        } else if state.waiters > 0 {
            GateStatus::Waiting
        } else {
            GateStatus::Locked
        }
    }

    /// Resolves `true` once every reason is lowered, `false` after `timeout`.
    /// Never lowers anything itself.
    pub async fn wait_for_unlock(&self, timeout: Duration) -> bool {
        let _waiter = {
            let mut state = self.state.lock().unwrap();
            if state.reasons.is_empty() {
                return true;
            }
            state.waiters += 1;
            Waiter(&self.state)
        };

        let mut unlocked = self.unlocked.subscribe();
        let opened = async move {
            // the sender lives as long as the gate
            let _ = unlocked.wait_for(|open| *open).await.map(|_| ());
        };

        tokio::time::timeout(timeout, opened).await.is_ok()
    }

    // ******************************
    // *        Animations          *
    // ******************************

    pub fn is_animating(&self) -> bool {
        self.state.lock().unwrap().animating.is_some()
    }

    /// Runs one animation through the gate.
    ///
    /// Rejected with [`AnimationError::Busy`] when another animation is in
    /// flight. Otherwise waits for the gate (failing open after the lock
    /// timeout), checks admission unless `force` is set, and dispatches.
    pub async fn request_animation(
        &self,
        request: AnimationRequest,
    ) -> Result<AnimationOutcome, AnimationError> {
        let name = request.name.clone();

        let mut flight = {
            let mut state = self.state.lock().unwrap();
            self.push_event(
                &mut state,
                GateEventKind::Request {
                    name: name.clone(),
                    force: request.force,
                },
            );

            if let Some(current) = &state.animating {
                tracing::debug!("animation '{name}' rejected, '{current}' is in flight");
                self.push_event(&mut state, GateEventKind::Rejected { name: name.clone() });
                return Err(AnimationError::Busy(name));
            }

            state.animating = Some(name.clone());
            Flight {
                gate: self,
                holds_lock: false,
            }
        };

        let started = Instant::now();

        if !self.wait_for_unlock(self.config.lock_timeout).await {
            self.reporter
                .report(EngineError::LockTimeout(self.config.lock_timeout));
        }

        let admitted = request.force || self.admit().await;
        let waited = started.elapsed();

        flight.holds_lock = !self.is_locked();
        if flight.holds_lock {
            self.lock(ANIMATING);
        }

        let method = if self.transitions.supports_view_transitions() {
            AnimationMethod::ViewTransition
        } else if request.motion.is_some() {
            AnimationMethod::Interpolation
        } else {
            AnimationMethod::None
        };

        self.event(GateEventKind::Dispatched {
            name: name.clone(),
            method,
        });

        let dispatched = Instant::now();
        let result = match (method, &request.motion) {
            (AnimationMethod::ViewTransition, _) => self.transitions.view_transition(&name).await,
            (AnimationMethod::Interpolation, Some(motion)) => self.interpolate(motion).await,
            _ => Ok(()),
        };

        self.event(GateEventKind::Finished {
            name: name.clone(),
            success: result.is_ok(),
        });
        drop(flight);

        match result {
            Ok(()) => Ok(AnimationOutcome {
                name,
                method,
                admitted,
                waited,
                duration: dispatched.elapsed(),
            }),
            Err(err) => Err(AnimationError::Execution(name, err)),
        }
    }

    pub fn history(&self) -> Vec<GateEvent> {
        self.state.lock().unwrap().history.iter().cloned().collect()
    }

    /// Polls the stability score and the task queue until both allow an
    /// animation, failing open after the admission timeout.
    async fn admit(&self) -> bool {
        let deadline = Instant::now() + self.config.admission_timeout;

        loop {
            let score = self.monitor.get_score();
            if score >= self.config.score_threshold && self.queue.is_idle() {
                return true;
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "admission not met (score {score:.0}, queue idle: {}), animating anyway",
                    self.queue.is_idle()
                );
                return false;
            }

            tokio::time::sleep(self.config.admission_poll).await;
        }
    }

    async fn interpolate(&self, motion: &Motion) -> anyhow::Result<()> {
        let started = Instant::now();

        let result = async {
            loop {
                let t = if motion.duration.is_zero() {
                    1.0
                } else {
                    started.elapsed().as_secs_f64() / motion.duration.as_secs_f64()
                };

                self.transitions
                    .apply_transform(&motion.target, motion.sample(t))?;

                if t >= 1.0 {
                    return Ok(());
                }

                self.frames.next_frame().await;
            }
        }
        .await;

        self.transitions.clear_transform(&motion.target);
        result
    }

    fn event(&self, kind: GateEventKind) {
        let mut state = self.state.lock().unwrap();
        self.push_event(&mut state, kind);
    }

    fn push_event(&self, state: &mut State, kind: GateEventKind) {
        let capacity = self.config.history_capacity.max(1);
        while state.history.len() >= capacity {
            state.history.pop_front();
        }
        state.history.push_back(GateEvent {
            at: self.created.elapsed(),
            kind,
        });
    }
}
