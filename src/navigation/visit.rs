use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::gatekeeper::AnimationOutcome;
use crate::history::Direction;
use crate::route::PageKind;
use crate::scheduler::TaskSpec;
use crate::stability::StabilityMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisitPhase {
    Init,
    ExitAnimating,
    ContentReplaced,
    EnterAnimating,
    Settled,
}

impl VisitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitPhase::Init => "init",
            VisitPhase::ExitAnimating => "exit-animating",
            VisitPhase::ContentReplaced => "content-replaced",
            VisitPhase::EnterAnimating => "enter-animating",
            VisitPhase::Settled => "settled",
        }
    }
}

/// The element that started a visit, reduced to its attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
    attributes: BTreeMap<String, String>,
}

impl Trigger {
    /// A plain link, or a programmatic visit.
    pub fn link() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// What the theme asks the controller to do.
#[derive(Debug, Clone)]
pub struct VisitRequest {
    /// Target as found in the `href`, resolved against the current location.
    pub href: String,
    pub trigger: Trigger,
    /// Whether to record the visit in the history. Back/forward replays run
    /// with `false`.
    pub push: bool,
    /// Extra post-swap work for this visit only, run after the registered
    /// hooks.
    pub tasks: Vec<TaskSpec>,
}

impl VisitRequest {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            trigger: Trigger::link(),
            push: true,
            tasks: Vec::new(),
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn replay(mut self) -> Self {
        self.push = false;
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }
}

/// The navigation in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: u64,
    pub from_kind: PageKind,
    /// Predicted from the URL at visit start, replaced by the kind read from
    /// the live document once the content is swapped.
    pub to_kind: PageKind,
    pub to_url: Url,
    pub uses_platform_transition: bool,
    pub phase: VisitPhase,
    /// When each phase was entered, as an offset from the visit start.
    pub timeline: Vec<(VisitPhase, Duration)>,
    #[serde(skip)]
    started: Instant,
}

impl Visit {
    pub(crate) fn new(id: u64, from_kind: PageKind, to_kind: PageKind, to_url: Url) -> Self {
        Self {
            id,
            from_kind,
            to_kind,
            to_url,
            uses_platform_transition: false,
            phase: VisitPhase::Init,
            timeline: vec![(VisitPhase::Init, Duration::ZERO)],
            started: Instant::now(),
        }
    }

    pub(crate) fn enter(&mut self, phase: VisitPhase) {
        debug_assert!(phase > self.phase, "visit phases only move forward");
        tracing::debug!("visit #{} {} -> {}", self.id, self.phase.as_str(), phase.as_str());
        self.phase = phase;
        self.timeline.push((phase, self.started.elapsed()));
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VisitOutcome {
    /// Content was swapped in place.
    Completed,
    /// Same document, only scrolled to the anchor.
    Anchor,
    /// The soft navigation could not proceed, a full page load was issued.
    FullLoad,
}

/// Summary of a finished visit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitReport {
    pub id: u64,
    pub url: Url,
    pub outcome: VisitOutcome,
    pub from_kind: PageKind,
    pub predicted_kind: PageKind,
    /// Kind read from the live document after the swap.
    pub settled_kind: Option<PageKind>,
    pub direction: Option<Direction>,
    pub uses_platform_transition: bool,
    pub animation: Option<AnimationOutcome>,
    pub stability: Option<StabilityMetrics>,
    pub timeline: Vec<(VisitPhase, Duration)>,
    pub duration: Duration,
}

impl VisitReport {
    /// Whether the URL prediction matched the document. Trivially true when
    /// nothing was swapped.
    pub fn kinds_agree(&self) -> bool {
        self.settled_kind
            .is_none_or(|settled| settled == self.predicted_kind)
    }

    pub(crate) fn from_visit(visit: Visit, predicted_kind: PageKind, outcome: VisitOutcome) -> Self {
        let settled_kind = match outcome {
            VisitOutcome::Completed => Some(visit.to_kind),
            VisitOutcome::Anchor | VisitOutcome::FullLoad => None,
        };

        Self {
            id: visit.id,
            duration: visit.elapsed(),
            url: visit.to_url,
            outcome,
            from_kind: visit.from_kind,
            predicted_kind,
            settled_kind,
            direction: None,
            uses_platform_transition: visit.uses_platform_transition,
            animation: None,
            stability: None,
            timeline: visit.timeline,
        }
    }
}
