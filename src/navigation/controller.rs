use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;

use super::hooks::{self, Hook};
use super::visit::{Visit, VisitOutcome, VisitPhase, VisitReport, VisitRequest};
use crate::Services;
use crate::config::NavigationConfig;
use crate::coordinator::CoordinatorRun;
use crate::error::{ConfigError, EngineError, NavigationError, SchedulerError};
use crate::gatekeeper::AnimationRequest;
use crate::history::{Direction, NavigationHistory, NavigationRecord};
use crate::motion::{Motion, Rect};
use crate::preload::Selector;
use crate::route::PageKind;
use crate::scheduler::{TaskSpec, TaskState};
use crate::utils::{resolve, same_document};

/// Lock reason held on the gate from visit start until the new page settled.
pub const NAVIGATING: &str = "navigating";

/// Owns the visit lifecycle and is the one surface the theme talks to.
///
/// A visit moves through `init`, `exit-animating`, `content-replaced`,
/// `enter-animating` and `settled`. Visits never overlap, a second
/// [`navigate`](Self::navigate) waits for the first one to finish.
pub struct NavigationController {
    config: NavigationConfig,
    services: Services,
    shared: Vec<(Selector, String)>,
    history: Mutex<NavigationHistory>,
    location: Mutex<Url>,
    hooks: Mutex<Vec<Hook>>,
    current: Mutex<Option<Visit>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    serial: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for NavigationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationController")
            .field("location", &*self.location.lock().unwrap())
            .field("visit", &*self.current.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl NavigationController {
    /// Creates the controller for a document already showing `location`.
    /// Fails when a shared-element selector does not parse.
    pub fn new(
        config: NavigationConfig,
        history_capacity: usize,
        services: Services,
        location: Url,
    ) -> Result<Self, ConfigError> {
        let kind = services
            .classifier
            .classify_document(services.host.document.as_ref());

        let mut history = NavigationHistory::new(history_capacity);
        history.push(NavigationRecord::new(location.clone(), kind));

        let shared = config
            .shared_elements
            .iter()
            .map(|(selector, name)| Ok((Selector::parse(selector)?, name.clone())))
            .collect::<Result<_, ConfigError>>()?;

        Ok(Self {
            config,
            services,
            shared,
            history: Mutex::new(history),
            location: Mutex::new(location),
            hooks: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            cleanup: Mutex::new(None),
            serial: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Adds a post-swap hook. Hooks run in registration order after every
    /// content swap.
    pub fn register_hook(&self, hook: Hook) {
        self.hooks.lock().unwrap().push(hook);
    }

    pub fn location(&self) -> Url {
        self.location.lock().unwrap().clone()
    }

    /// The visit in flight, if any.
    pub fn visit(&self) -> Option<Visit> {
        self.current.lock().unwrap().clone()
    }

    pub fn history(&self) -> Vec<NavigationRecord> {
        self.history.lock().unwrap().records().to_vec()
    }

    /// The history record of the page currently shown.
    pub fn current(&self) -> Option<NavigationRecord> {
        self.history.lock().unwrap().current().cloned()
    }

    pub fn direction(&self, url: &Url) -> Direction {
        self.history.lock().unwrap().direction(url)
    }

    /// Soft-navigates to the requested location.
    ///
    /// Fails only when the target cannot be parsed. A fetch or swap failure
    /// falls back to a full page load and is reported as
    /// [`VisitOutcome::FullLoad`].
    pub async fn navigate(&self, request: VisitRequest) -> Result<VisitReport, NavigationError> {
        let _serial = self.serial.lock().await;
        let url = self.target(&request.href)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("visit", id, url = %url);
        Ok(self.run(id, url, request, None).instrument(span).await)
    }

    /// Handles a browser back/forward. The direction comes from the history
    /// stack, and the visit is replayed without pushing a new entry.
    pub async fn on_popstate(&self, href: &str) -> Result<VisitReport, NavigationError> {
        let _serial = self.serial.lock().await;
        let url = self.target(href)?;

        let direction = self.direction(&url);
        tracing::info!("popstate to {url} ({direction:?})");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("visit", id, url = %url);
        let request = VisitRequest::new(href).replay();

        let mut report = self.run(id, url, request, Some(direction)).instrument(span).await;
        report.direction = Some(direction);
        Ok(report)
    }

    fn target(&self, href: &str) -> Result<Url, NavigationError> {
        let base = self.location();
        resolve(href, Some(&base)).map_err(|err| {
            self.services
                .reporter
                .report(NavigationError::InvalidUrl(href.to_string(), err));
            NavigationError::InvalidUrl(href.to_string(), err)
        })
    }

    async fn run(
        &self,
        id: u64,
        url: Url,
        request: VisitRequest,
        direction: Option<Direction>,
    ) -> VisitReport {
        let document = self.services.host.document.clone();
        let base = self.location();

        if same_document(&url, &base) && (url.fragment().is_some() || base.fragment().is_some()) {
            return self.anchor(id, url, request.push);
        }

        self.cancel_cleanup();

        // init
        let from_kind = self.services.classifier.classify_document(document.as_ref());
        let predicted = self.services.classifier.classify_url(&url);

        let card = request
            .trigger
            .has_attribute(&self.config.shared_element_attribute);
        let mut visit = Visit::new(id, from_kind, predicted, url.clone());
        visit.uses_platform_transition =
            card && self.services.host.transitions.supports_view_transitions();
        tracing::info!(
            "visit {} -> {}{}",
            from_kind,
            predicted,
            if visit.uses_platform_transition { " (shared element)" } else { "" }
        );

        let restore = {
            let mut history = self.history.lock().unwrap();
            history.update_scroll(document.scroll_offset());
            direction
                .and_then(|direction| history.step(direction, &url))
                .map(|record| record.scroll_offset)
        };

        self.services.gate.lock(NAVIGATING);
        let mut run = self.services.coordinator.begin(&url);
        self.publish(&visit);

        // exit-animating
        visit.enter(VisitPhase::ExitAnimating);
        self.publish(&visit);
        document.add_class(&self.config.leaving_class);
        if visit.uses_platform_transition {
            self.name_shared(true);
        }
        let origins = if card && !visit.uses_platform_transition {
            self.measure_shared()
        } else {
            Vec::new()
        };

        let Some(entry) = self.services.coordinator.prepare(&mut run).await else {
            self.services
                .reporter
                .report(NavigationError::Fetch(url.to_string()));
            return self.fall_back(visit, predicted, run);
        };

        // content-replaced
        if let Err(err) = document.replace_content(&entry.fragment) {
            self.services.reporter.report(NavigationError::Swap(err));
            return self.fall_back(visit, predicted, run);
        }

        visit.to_kind = self.services.classifier.classify_document(document.as_ref());
        visit.enter(VisitPhase::ContentReplaced);
        self.publish(&visit);

        if visit.to_kind != predicted {
            tracing::debug!("predicted {predicted} but the document is {}", visit.to_kind);
        }

        document.remove_class(&self.config.leaving_class);
        document.add_class(&self.config.entering_class);
        if visit.uses_platform_transition {
            self.name_shared(true);
        }
        self.scroll(&url, restore);

        self.services.monitor.start();

        match self.schedule(&url, visit.to_kind, request.tasks) {
            Ok(()) => {
                if let Err(err) = self.services.coordinator.initialize(&mut run).await {
                    self.services.reporter.report(NavigationError::Scheduler(err));
                }
                self.report_skipped_hooks();
            }
            Err(err) => {
                self.services.reporter.report(err);
            }
        }

        // enter-animating
        visit.enter(VisitPhase::EnterAnimating);
        self.publish(&visit);

        let name = if card { "shared-element" } else { "page-enter" };
        let mut animation = AnimationRequest::new(name);
        if let Some(motion) = self.motion(&origins) {
            tracing::debug!("interpolating {} without view transitions", motion.target);
            animation = animation.motion(motion);
        }

        let coordinator = &self.services.coordinator;
        let (animation, stability) = tokio::join!(
            self.services.gate.request_animation(animation),
            async {
                let metrics = coordinator.stabilize(&mut run).await;
                coordinator.release(&mut run, NAVIGATING);
                metrics
            }
        );

        self.services.monitor.stop();

        let animation = animation
            .inspect_err(|err| tracing::debug!("enter animation: {err}"))
            .map_err(|err| self.services.reporter.report(err))
            .ok();

        // settled
        visit.enter(VisitPhase::Settled);
        self.schedule_cleanup();

        if request.push {
            let mut history = self.history.lock().unwrap();
            history.push(NavigationRecord::new(url.clone(), visit.to_kind));
            self.services.host.history.push_state(&url);
        } else {
            self.services.host.history.replace_state(&url);
        }
        *self.location.lock().unwrap() = url;
        *self.current.lock().unwrap() = None;

        self.services.coordinator.finish(run);

        let mut report = VisitReport::from_visit(visit, predicted, VisitOutcome::Completed);
        report.direction = direction.or(Some(Direction::Forward));
        report.animation = animation;
        report.stability = Some(stability);

        tracing::info!(
            "visit settled in {:.2?} with score {:.0}",
            report.duration,
            stability.total_score
        );

        report
    }

    /// Same document, different fragment: scroll only.
    fn anchor(&self, id: u64, url: Url, push: bool) -> VisitReport {
        let document = &self.services.host.document;

        match url.fragment() {
            Some(anchor) if document.scroll_to_anchor(anchor) => {}
            Some(anchor) => tracing::debug!("no element with id '{anchor}'"),
            None => document.scroll_to(0.0),
        }

        if push {
            self.services.host.history.push_state(&url);
        }

        let kind = self
            .services
            .classifier
            .classify_document(document.as_ref());
        let visit = Visit::new(id, kind, kind, url.clone());
        *self.location.lock().unwrap() = url;

        VisitReport::from_visit(visit, kind, VisitOutcome::Anchor)
    }

    /// Gives up on the soft navigation and asks for a full page load.
    fn fall_back(&self, visit: Visit, predicted: PageKind, mut run: CoordinatorRun) -> VisitReport {
        let document = &self.services.host.document;
        document.remove_class(&self.config.leaving_class);
        if visit.uses_platform_transition {
            self.name_shared(false);
        }

        self.services.coordinator.release(&mut run, NAVIGATING);
        self.services.coordinator.finish(run);
        *self.current.lock().unwrap() = None;

        tracing::warn!("falling back to a full load of {}", visit.to_url);
        self.services.host.history.assign(&visit.to_url);

        VisitReport::from_visit(visit, predicted, VisitOutcome::FullLoad)
    }

    /// Boxes of the shared elements on the outgoing page, in configuration
    /// order.
    fn measure_shared(&self) -> Vec<Option<Rect>> {
        let document = &self.services.host.document;
        self.shared
            .iter()
            .map(|(selector, _)| document.rect(selector))
            .collect()
    }

    /// Interpolation of the first shared element present on both pages.
    fn motion(&self, origins: &[Option<Rect>]) -> Option<Motion> {
        let document = &self.services.host.document;

        self.shared
            .iter()
            .zip(origins)
            .find_map(|((selector, _), from)| {
                Some(Motion {
                    target: selector.to_string(),
                    from: (*from)?,
                    to: document.rect(selector)?,
                    duration: self.config.enter_duration,
                })
            })
    }

    fn name_shared(&self, on: bool) {
        for (selector, name) in &self.shared {
            let named = self
                .services
                .host
                .document
                .set_transition_name(selector, on.then_some(name.as_str()));
            tracing::trace!("transition name '{name}' on {named} element(s)");
        }
    }

    /// Anchor first, then the offset saved for a replayed entry, then the top.
    fn scroll(&self, url: &Url, restore: Option<f64>) {
        let document = &self.services.host.document;

        if let Some(anchor) = url.fragment()
            && document.scroll_to_anchor(anchor)
        {
            return;
        }

        document.scroll_to(restore.unwrap_or(0.0));
    }

    /// Replaces whatever the queue held with this visit's hooks and tasks.
    fn schedule(
        &self,
        url: &Url,
        kind: PageKind,
        extra: Vec<TaskSpec>,
    ) -> Result<(), SchedulerError> {
        let queue = &self.services.queue;
        queue.clear()?;

        let hooks = self.hooks.lock().unwrap().clone();
        let last = hooks.last().map(Hook::task_id);

        for task in hooks::chain(&hooks, url, kind) {
            queue.add(task)?;
        }
        for mut task in extra {
            if let Some(last) = &last {
                task = task.depends_on(last.clone());
            }
            queue.add(task)?;
        }

        Ok(())
    }

    fn report_skipped_hooks(&self) {
        let diagnostics = self.services.queue.diagnostics();
        for task in diagnostics.tasks {
            if task.state == TaskState::Skipped
                && let Some(error) = task.error
            {
                self.services
                    .reporter
                    .report(EngineError::Hook(task.name, anyhow::anyhow!(error)));
            }
        }
    }

    fn publish(&self, visit: &Visit) {
        *self.current.lock().unwrap() = Some(visit.clone());
    }

    fn cancel_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().unwrap().take() {
            handle.abort();
            tracing::trace!("pending cleanup aborted");
        }
        let document = &self.services.host.document;
        document.remove_class(&self.config.entering_class);
        document.remove_class(&self.config.leaving_class);
    }

    /// Drops the transient classes and transition names once the entry
    /// animation had time to finish.
    fn schedule_cleanup(&self) {
        let document = self.services.host.document.clone();
        let entering = self.config.entering_class.clone();
        let delay = self.config.cleanup_delay;
        let shared: Vec<_> = self.shared.iter().map(|(selector, _)| selector.clone()).collect();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            document.remove_class(&entering);
            for selector in &shared {
                document.set_transition_name(selector, None);
            }
            tracing::trace!("visit cleanup done");
        });

        *self.cleanup.lock().unwrap() = Some(handle);
    }
}

impl Drop for NavigationController {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::gatekeeper::AnimationMethod;
    use crate::host::memory::{
        HistoryCall, MemoryDocument, MemoryHistory, MemoryTransitions, RecordingLayout,
        StaticFetcher,
    };
    use crate::host::{Document, Host, TokioFrames, TokioIdle};
    use crate::motion::Transform;
    use crate::navigation::Trigger;

    const LIST: &str = r#"<body data-page-type="list"><main>
        <article class="post-preview"><img class="post-cover" src="/a.png" width="320" height="180"><h2 class="post-title">A</h2></article>
        <article class="post-preview"><img class="post-cover" src="/b.png"><h2 class="post-title">B</h2></article>
    </main></body>"#;

    const SINGLE: &str = r#"<html><head><title>A</title></head><body><main>
        <article class="post-full"><img class="post-cover" src="/a.png" width="960" height="540"><h1 class="post-title">A</h1>
        <h2 id="comments">Comments</h2></article>
    </main></body></html>"#;

    struct Fixture {
        controller: NavigationController,
        services: Services,
        document: Arc<MemoryDocument>,
        history: Arc<MemoryHistory>,
        fetcher: Arc<StaticFetcher>,
        transitions: Arc<MemoryTransitions>,
    }

    fn fixture() -> Fixture {
        fixture_on(true)
    }

    fn fixture_on(view_transitions: bool) -> Fixture {
        let document = Arc::new(MemoryDocument::new(LIST));
        let history = Arc::new(MemoryHistory::new());
        let transitions = Arc::new(MemoryTransitions::new(view_transitions));
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_page("https://b.example/archives/1", SINGLE)
                .with_page("https://b.example/archives/2", SINGLE)
                .with_page("https://b.example/", LIST),
        );

        let host = Host {
            fetcher: fetcher.clone(),
            layout: Arc::new(RecordingLayout::new()),
            document: document.clone(),
            history: history.clone(),
            transitions: transitions.clone(),
            idle: Arc::new(TokioIdle),
            frames: Arc::new(TokioFrames::default()),
        };

        let config = Config::default();
        let services = Services::new(&config, host).unwrap();
        let controller = NavigationController::new(
            config.navigation,
            config.history.capacity,
            services.clone(),
            Url::parse("https://b.example/").unwrap(),
        )
        .unwrap();

        Fixture {
            controller,
            services,
            document,
            history,
            fetcher,
            transitions,
        }
    }

    fn card() -> Trigger {
        Trigger::link().with_attribute("data-shared-element", "")
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_to_single_with_shared_element() {
        let Fixture {
            controller,
            services,
            document,
            history,
            ..
        } = fixture();

        let report = controller
            .navigate(VisitRequest::new("/archives/1").trigger(card()))
            .await
            .unwrap();

        assert_eq!(report.outcome, VisitOutcome::Completed);
        assert!(report.uses_platform_transition);
        assert_eq!(report.from_kind, PageKind::List);
        assert_eq!(report.predicted_kind, PageKind::Single);
        assert_eq!(report.settled_kind, Some(PageKind::Single));
        assert!(report.kinds_agree());

        let phases: Vec<_> = report.timeline.iter().map(|(phase, _)| *phase).collect();
        assert_eq!(
            phases,
            vec![
                VisitPhase::Init,
                VisitPhase::ExitAnimating,
                VisitPhase::ContentReplaced,
                VisitPhase::EnterAnimating,
                VisitPhase::Settled
            ]
        );

        assert_eq!(document.title().as_deref(), Some("A"));
        assert!(!document.has_class("is-leaving"));
        assert!(document.has_class("is-entering"));
        assert_eq!(document.transition_names(), vec!["post-cover", "post-title"]);

        assert!(!services.gate.is_locked());
        assert_eq!(
            report.animation.as_ref().map(|a| a.name.as_str()),
            Some("shared-element")
        );
        assert!(report.stability.is_some_and(|m| !m.timed_out));

        assert_eq!(
            history.calls(),
            vec![HistoryCall::Push(
                Url::parse("https://b.example/archives/1").unwrap()
            )]
        );
        assert_eq!(controller.location().path(), "/archives/1");
        assert_eq!(controller.history().len(), 2);
        assert!(controller.visit().is_none());

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(!document.has_class("is-entering"));
        assert!(document.transition_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_link_is_not_shared() {
        let Fixture { controller, .. } = fixture();

        let report = controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();

        assert!(!report.uses_platform_transition);
        assert_eq!(
            report.animation.as_ref().map(|a| a.name.as_str()),
            Some("page-enter")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_card_interpolates_without_view_transitions() {
        let Fixture {
            controller,
            document,
            transitions,
            ..
        } = fixture_on(false);

        let report = controller
            .navigate(VisitRequest::new("/archives/1").trigger(card()))
            .await
            .unwrap();

        assert!(!report.uses_platform_transition);
        assert!(document.transition_names().is_empty());
        assert!(transitions.started().is_empty());

        let animation = report.animation.unwrap();
        assert_eq!(animation.name, "shared-element");
        assert_eq!(animation.method, AnimationMethod::Interpolation);

        let frames = transitions.frames();
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|(target, _)| target == ".post-cover"));

        // starts over the small list card, ends in place at full size
        let first = frames[0].1;
        assert!((first.sx - 1.0 / 3.0).abs() < 1e-9);
        assert_ne!(first.dy, 0.0);
        assert_eq!(frames.last().unwrap().1, Transform::IDENTITY);
        assert_eq!(transitions.cleared(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_link_is_not_interpolated() {
        let Fixture {
            controller,
            transitions,
            ..
        } = fixture_on(false);

        let report = controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();

        assert_eq!(
            report.animation.map(|animation| animation.method),
            Some(AnimationMethod::None)
        );
        assert!(transitions.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_falls_back_to_full_load() {
        let Fixture {
            controller,
            services,
            document,
            history,
            ..
        } = fixture();

        let report = controller
            .navigate(VisitRequest::new("/archives/404").trigger(card()))
            .await
            .unwrap();

        assert_eq!(report.outcome, VisitOutcome::FullLoad);
        assert!(report.settled_kind.is_none());
        assert_eq!(
            history.calls(),
            vec![HistoryCall::Assign(
                Url::parse("https://b.example/archives/404").unwrap()
            )]
        );
        assert!(!services.gate.is_locked());
        assert!(!document.has_class("is-leaving"));
        assert!(document.transition_names().is_empty());
        assert_eq!(document.swaps(), 0);
        assert_eq!(services.reporter.counts().fatal, 1);
        assert_eq!(controller.location().path(), "/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_failure_falls_back_to_full_load() {
        let Fixture {
            controller,
            document,
            history,
            ..
        } = fixture();
        document
            .fail_swap
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let report = controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();

        assert_eq!(report.outcome, VisitOutcome::FullLoad);
        assert!(matches!(history.calls()[..], [HistoryCall::Assign(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_url() {
        let Fixture {
            controller,
            services,
            ..
        } = fixture();

        let result = controller.navigate(VisitRequest::new("http://[::1")).await;
        assert!(matches!(result, Err(NavigationError::InvalidUrl(..))));
        assert_eq!(services.reporter.counts().fatal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_run_in_order_and_failures_are_isolated() {
        let Fixture {
            controller,
            services,
            ..
        } = fixture();

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["highlight", "lazy-images", "comments", "toc"] {
            let order = order.clone();
            controller.register_hook(Hook::new(name, move |ctx| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push((name, ctx.kind));
                    let result: crate::error::TaskResult = if name == "lazy-images" {
                        Err(anyhow::anyhow!("no observer"))
                    } else {
                        Ok(())
                    };
                    result
                }
            }));
        }

        let extra = Arc::new(AtomicUsize::new(0));
        let counter = extra.clone();
        let task = TaskSpec::new("analytics", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        controller
            .navigate(VisitRequest::new("/archives/1").task(task))
            .await
            .unwrap();

        let order: Vec<_> = order.lock().unwrap().clone();
        assert_eq!(
            order,
            vec![
                ("highlight", PageKind::Single),
                ("lazy-images", PageKind::Single),
                ("comments", PageKind::Single),
                ("toc", PageKind::Single)
            ]
        );
        assert_eq!(extra.load(Ordering::Relaxed), 1);
        assert_eq!(
            services.queue.state("hook:lazy-images"),
            Some(TaskState::Skipped)
        );
        assert_eq!(services.queue.state("hook:toc"), Some(TaskState::Completed));
        assert_eq!(services.reporter.counts().recoverable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popstate_replays_without_push() {
        let Fixture {
            controller,
            document,
            history,
            fetcher,
            ..
        } = fixture();

        document.scroll_to(640.0);
        controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();
        assert_eq!(document.scroll_offset(), 0.0);

        let report = controller.on_popstate("https://b.example/").await.unwrap();

        assert_eq!(report.direction, Some(Direction::Back));
        assert_eq!(report.outcome, VisitOutcome::Completed);
        assert_eq!(report.settled_kind, Some(PageKind::List));
        assert_eq!(document.scroll_offset(), 640.0);

        // only the first visit pushed, the replay rewrote the entry it landed on
        let root = Url::parse("https://b.example/").unwrap();
        let single = Url::parse("https://b.example/archives/1").unwrap();
        assert_eq!(
            history.calls(),
            vec![HistoryCall::Push(single.clone()), HistoryCall::Replace(root)]
        );
        assert_eq!(controller.history().len(), 2);
        assert_eq!(fetcher.call_count("https://b.example/"), 1);

        let report = controller
            .on_popstate("https://b.example/archives/1")
            .await
            .unwrap();
        assert_eq!(report.direction, Some(Direction::Forward));
        assert_eq!(history.calls().last(), Some(&HistoryCall::Replace(single)));
        assert_eq!(history.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popstate_over_several_entries() {
        let Fixture {
            controller,
            document,
            ..
        } = fixture();

        document.scroll_to(300.0);
        controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();
        controller
            .navigate(VisitRequest::new("/archives/2"))
            .await
            .unwrap();

        // a long press on back skips /archives/1 entirely
        controller.on_popstate("https://b.example/").await.unwrap();

        assert_eq!(controller.current().unwrap().url.path(), "/");
        assert_eq!(document.scroll_offset(), 300.0);

        controller
            .navigate(VisitRequest::new("/archives/2"))
            .await
            .unwrap();
        let paths: Vec<_> = controller
            .history()
            .iter()
            .map(|record| record.url.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/", "/archives/2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_document_anchor() {
        let Fixture {
            controller,
            document,
            history,
            ..
        } = fixture();

        controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();
        let swaps = document.swaps();

        let report = controller
            .navigate(VisitRequest::new("#comments"))
            .await
            .unwrap();

        assert_eq!(report.outcome, VisitOutcome::Anchor);
        assert_eq!(document.swaps(), swaps);
        assert_eq!(document.anchor().as_deref(), Some("comments"));
        assert_eq!(history.calls().len(), 2);
        assert_eq!(controller.location().fragment(), Some("comments"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_visit_cancels_pending_cleanup() {
        let Fixture {
            controller,
            document,
            ..
        } = fixture();

        controller
            .navigate(VisitRequest::new("/archives/1"))
            .await
            .unwrap();
        assert!(document.has_class("is-entering"));

        // the second visit outlasts the first one's cleanup delay
        controller.navigate(VisitRequest::new("/")).await.unwrap();
        assert!(document.has_class("is-entering"));

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(!document.has_class("is-entering"));
    }
}
