#![forbid(unsafe_code)]
//! Navigation and preload orchestration for PJAX-style website themes.
//!
//! The engine decides when a page transition may start, what has to finish
//! before it, and when the new page is calm enough to animate. Every browser
//! surface it touches sits behind a trait in [`host`], so the whole pipeline
//! runs the same against a real page and against the in-memory doubles.
//!
//! ```rust,ignore
//! use utsuri::{Config, Engine, VisitRequest, Trigger};
//!
//! let engine = Engine::new(Config::from_json(json)?, host, location)?;
//! engine.controller().register_hook(Hook::new("toc", |ctx| async move { rebuild_toc(ctx) }));
//!
//! let report = engine
//!     .controller()
//!     .navigate(VisitRequest::new("/archives/42/").trigger(
//!         Trigger::link().with_attribute("data-shared-element", ""),
//!     ))
//!     .await?;
//! ```

pub mod config;
mod coordinator;
mod core;
mod error;
mod gatekeeper;
mod history;
pub mod host;
mod motion;
mod navigation;
mod preload;
mod route;
mod scheduler;
mod stability;
mod utils;

use std::sync::Arc;

use url::Url;

pub use crate::config::Config;
pub use crate::coordinator::{CoordinatorRun, Phase, PhaseMetrics, PreloadCoordinator};
pub use crate::core::Hash32;
pub use crate::error::*;
pub use crate::gatekeeper::{
    ANIMATING, AnimationMethod, AnimationOutcome, AnimationRequest, GateEvent, GateEventKind,
    GateStatus, TransitionGatekeeper,
};
pub use crate::history::{Direction, NavigationHistory, NavigationRecord};
pub use crate::host::Host;
pub use crate::motion::{Motion, Rect, Transform};
pub use crate::navigation::{
    Hook, HookContext, NAVIGATING, NavigationController, Trigger, Visit, VisitOutcome, VisitPhase,
    VisitReport, VisitRequest,
};
pub use crate::preload::{
    Element, Fragment, Node, NodeKind, PagePreloader, PreloadEntry, PreloadStats, Resources,
    Selector,
};
pub use crate::route::{PageKind, RouteClassifier};
pub use crate::scheduler::{
    Diagnostics, MAX_PRIORITY, QueueOutcome, TaskContext, TaskExecution, TaskQueue, TaskReport,
    TaskSpec, TaskState, Transition,
};
pub use crate::stability::{Penalties, Signal, StabilityMetrics, StabilityMonitor};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// The shared services of one page, constructed once and handed to every
/// component that needs them.
#[derive(Clone)]
pub struct Services {
    pub host: Host,
    pub reporter: Arc<ErrorReporter>,
    pub classifier: Arc<RouteClassifier>,
    pub preloader: Arc<PagePreloader>,
    pub queue: Arc<TaskQueue>,
    pub monitor: Arc<StabilityMonitor>,
    pub gate: Arc<TransitionGatekeeper>,
    pub coordinator: Arc<PreloadCoordinator>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("preloader", &self.preloader)
            .field("queue", &self.queue)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Wires the components together over `host`. Fails on an invalid route
    /// pattern.
    pub fn new(config: &Config, host: Host) -> Result<Self, ConfigError> {
        let reporter = Arc::new(ErrorReporter::new());
        let classifier = Arc::new(RouteClassifier::new(&config.routes)?);

        let preloader = Arc::new(PagePreloader::new(
            config.preload.clone(),
            host.fetcher.clone(),
            host.layout.clone(),
            reporter.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(config.scheduler.clone(), host.idle.clone()));
        let monitor = Arc::new(StabilityMonitor::new(
            config.stability.clone(),
            host.frames.clone(),
        ));
        let gate = Arc::new(TransitionGatekeeper::new(
            config.gatekeeper.clone(),
            host.transitions.clone(),
            host.frames.clone(),
            monitor.clone(),
            queue.clone(),
            reporter.clone(),
        ));
        let coordinator = Arc::new(PreloadCoordinator::new(
            config.coordinator.clone(),
            preloader.clone(),
            queue.clone(),
            monitor.clone(),
            gate.clone(),
        ));

        Ok(Self {
            host,
            reporter,
            classifier,
            preloader,
            queue,
            monitor,
            gate,
            coordinator,
        })
    }
}

/// Entry point: the services plus the navigation controller on top of them.
#[derive(Debug, Clone)]
pub struct Engine {
    services: Services,
    controller: Arc<NavigationController>,
}

impl Engine {
    /// Builds the engine for a document currently showing `location`.
    pub fn new(config: Config, host: Host, location: Url) -> Result<Self, ConfigError> {
        let services = Services::new(&config, host)?;
        let controller = Arc::new(NavigationController::new(
            config.navigation,
            config.history.capacity,
            services.clone(),
            location,
        )?);

        tracing::debug!("engine ready");

        Ok(Self {
            services,
            controller,
        })
    }

    /// Same as [`Engine::new`], with the configuration given as the theme's
    /// JSON object.
    pub fn from_json(json: &str, host: Host, location: Url) -> Result<Self, ConfigError> {
        Self::new(Config::from_json(json)?, host, location)
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn controller(&self) -> &Arc<NavigationController> {
        &self.controller
    }

    pub fn preloader(&self) -> &Arc<PagePreloader> {
        &self.services.preloader
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.services.queue
    }

    pub fn monitor(&self) -> &Arc<StabilityMonitor> {
        &self.services.monitor
    }

    pub fn gate(&self) -> &Arc<TransitionGatekeeper> {
        &self.services.gate
    }

    pub fn coordinator(&self) -> &Arc<PreloadCoordinator> {
        &self.services.coordinator
    }

    pub fn errors(&self) -> ErrorCounts {
        self.services.reporter.counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{
        MemoryDocument, MemoryHistory, MemoryTransitions, RecordingLayout, StaticFetcher,
    };
    use crate::host::{TokioFrames, TokioIdle};

    fn host() -> Host {
        Host {
            fetcher: Arc::new(StaticFetcher::new().with_page(
                "https://b.example/about",
                r#"<main><article class="page"></article></main>"#,
            )),
            layout: Arc::new(RecordingLayout::new()),
            document: Arc::new(MemoryDocument::new(
                r#"<main><article class="post-preview"></article><article class="post-preview"></article></main>"#,
            )),
            history: Arc::new(MemoryHistory::new()),
            transitions: Arc::new(MemoryTransitions::new(false)),
            idle: Arc::new(TokioIdle),
            frames: Arc::new(TokioFrames::default()),
        }
    }

    fn location() -> Url {
        Url::parse("https://b.example/").unwrap()
    }

    #[test]
    fn test_invalid_route_pattern() {
        let result = Engine::from_json(r#"{ "routes": { "page": ["/["] } }"#, host(), location());
        assert!(matches!(result, Err(ConfigError::Pattern(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_end_to_end() {
        let engine = Engine::from_json(r#"{ "coordinator": { "historyCapacity": 5 } }"#, host(), location())
            .unwrap();

        let report = engine
            .controller()
            .navigate(VisitRequest::new("/about"))
            .await
            .unwrap();

        assert_eq!(report.from_kind, PageKind::List);
        assert_eq!(report.predicted_kind, PageKind::Page);
        assert!(report.kinds_agree());
        assert_eq!(
            report.animation.map(|animation| animation.method),
            Some(AnimationMethod::None)
        );

        assert_eq!(engine.preloader().stats().misses, 1);
        assert_eq!(engine.coordinator().history().len(), 1);
        assert_eq!(engine.coordinator().success_rate(), Some(1.0));
        assert!(!engine.gate().is_locked());
        assert_eq!(engine.errors(), ErrorCounts::default());
    }
}
