//! In-memory host implementations.
//!
//! These stand in for the browser in tests and in headless embeddings. The
//! live document is itself a [`Fragment`], so swapping content and then
//! classifying the page from the DOM behaves like it would in a browser.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchError;
use crate::host::{Document, Fetcher, HistoryApi, LayoutHost, OffscreenId, TransitionHost};
use crate::motion::{Rect, Transform};
use crate::preload::{Fragment, Selector};

// ******************************
// *          Fetcher           *
// ******************************

#[derive(Debug, Clone)]
pub enum Response {
    Html(String),
    Status(u16),
    NetworkError,
}

/// Serves canned responses, optionally after a fixed latency.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: Mutex<HashMap<String, Response>>,
    failures: Mutex<HashMap<String, usize>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<Url>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: impl Into<String>) -> Self {
        self.set(url, Response::Html(html.into()));
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = latency;
        self
    }

    pub fn set(&self, url: &str, response: Response) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    /// Makes the next `times` requests for `url` fail with a network error.
    pub fn fail_times(&self, url: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
    }

    /// Every URL requested so far, in order.
    pub fn calls(&self) -> Vec<Url> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

impl Fetcher for StaticFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(url.clone());
            let latency = *self.latency.lock().unwrap();

            if !latency.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled(url.to_string())),
                    _ = tokio::time::sleep(latency) => {}
                }
            }

            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled(url.to_string()));
            }

            if let Some(left) = self.failures.lock().unwrap().get_mut(url.as_str())
                && *left > 0
            {
                *left -= 1;
                return Err(FetchError::Network(
                    url.to_string(),
                    anyhow::anyhow!("connection reset"),
                ));
            }

            let response = self.routes.lock().unwrap().get(url.as_str()).cloned();
            match response {
                Some(Response::Html(html)) => Ok(html),
                Some(Response::Status(status)) => Err(FetchError::Status(url.to_string(), status)),
                Some(Response::NetworkError) => Err(FetchError::Network(
                    url.to_string(),
                    anyhow::anyhow!("connection reset"),
                )),
                None => Err(FetchError::Status(url.to_string(), 404)),
            }
        })
    }
}

// ******************************
// *           Layout           *
// ******************************

/// Layout host that only counts what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingLayout {
    next: AtomicU64,
    attached: Mutex<BTreeSet<u64>>,
    pub measures: AtomicUsize,
    pub detaches: AtomicUsize,
    pub fail: AtomicBool,
}

impl RecordingLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached(&self) -> usize {
        self.attached.lock().unwrap().len()
    }
}

impl LayoutHost for RecordingLayout {
    fn attach(&self, fragment: &Fragment) -> anyhow::Result<OffscreenId> {
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("off-screen container unavailable");
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.attached.lock().unwrap().insert(id);
        tracing::trace!("attached fragment of {} nodes as #{id}", fragment.len());
        Ok(OffscreenId(id))
    }

    fn measure(&self, id: OffscreenId) -> anyhow::Result<f64> {
        if !self.attached.lock().unwrap().contains(&id.0) {
            anyhow::bail!("fragment #{} is not attached", id.0);
        }
        self.measures.fetch_add(1, Ordering::Relaxed);
        Ok(0.0)
    }

    fn detach(&self, id: OffscreenId) {
        if self.attached.lock().unwrap().remove(&id.0) {
            self.detaches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ******************************
// *          Document          *
// ******************************

#[derive(Debug, Default)]
struct DocumentState {
    dom: Fragment,
    classes: BTreeSet<String>,
    transition_names: Vec<(Selector, String)>,
    scroll: f64,
    anchor: Option<String>,
    swaps: usize,
}

/// A live document backed by a parsed [`Fragment`].
#[derive(Debug, Default)]
pub struct MemoryDocument {
    state: Mutex<DocumentState>,
    pub fail_swap: AtomicBool,
}

impl MemoryDocument {
    pub fn new(html: &str) -> Self {
        Self {
            state: Mutex::new(DocumentState {
                dom: Fragment::parse(html),
                ..Default::default()
            }),
            fail_swap: AtomicBool::new(false),
        }
    }

    pub fn classes(&self) -> Vec<String> {
        self.state.lock().unwrap().classes.iter().cloned().collect()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.state.lock().unwrap().classes.contains(class)
    }

    /// Transition names currently set, as `(selector, name)`.
    pub fn transition_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .transition_names
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn swaps(&self) -> usize {
        self.state.lock().unwrap().swaps
    }

    pub fn anchor(&self) -> Option<String> {
        self.state.lock().unwrap().anchor.clone()
    }

    pub fn title(&self) -> Option<String> {
        self.state.lock().unwrap().dom.title()
    }
}

impl Document for MemoryDocument {
    fn nav_root_attribute(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .dom
            .elements()
            .find_map(|el| el.attr(name).map(str::to_string))
    }

    fn count(&self, selector: &Selector) -> usize {
        self.state.lock().unwrap().dom.count(selector)
    }

    fn replace_content(&self, fragment: &Fragment) -> anyhow::Result<()> {
        if self.fail_swap.load(Ordering::Relaxed) {
            anyhow::bail!("swap container missing");
        }
        let mut state = self.state.lock().unwrap();
        state.dom = fragment.clone();
        state.transition_names.clear();
        state.anchor = None;
        state.swaps += 1;
        Ok(())
    }

    fn add_class(&self, class: &str) {
        self.state.lock().unwrap().classes.insert(class.to_string());
    }

    fn remove_class(&self, class: &str) {
        self.state.lock().unwrap().classes.remove(class);
    }

    fn set_transition_name(&self, selector: &Selector, name: Option<&str>) -> usize {
        let mut state = self.state.lock().unwrap();
        let matched = state.dom.count(selector);

        state.transition_names.retain(|(s, _)| s != selector);
        if let Some(name) = name
            && matched > 0
        {
            state
                .transition_names
                .push((selector.clone(), name.to_string()));
        }

        matched
    }

    fn rect(&self, selector: &Selector) -> Option<Rect> {
        let state = self.state.lock().unwrap();
        let element = state.dom.select(selector).next()?;
        let size = |name| {
            element
                .attr(name)
                .and_then(|value| value.parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        // Same stand-in as for anchors: the node index is the document offset.
        Some(Rect::new(
            0.0,
            element.index() as f64 - state.scroll,
            size("width"),
            size("height"),
        ))
    }

    fn scroll_offset(&self) -> f64 {
        self.state.lock().unwrap().scroll
    }

    fn scroll_to(&self, offset: f64) {
        let mut state = self.state.lock().unwrap();
        state.scroll = offset.max(0.0);
        state.anchor = None;
    }

    fn scroll_to_anchor(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.dom.find_by_id(id).map(|el| el.index()) else {
            return false;
        };
        // No real layout here, the node index stands in for the offset.
        state.scroll = index as f64;
        state.anchor = Some(id.to_string());
        true
    }
}

// ******************************
// *          History           *
// ******************************

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryCall {
    Push(Url),
    Replace(Url),
    Assign(Url),
}

#[derive(Debug, Default)]
pub struct MemoryHistory {
    calls: Mutex<Vec<HistoryCall>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HistoryCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl HistoryApi for MemoryHistory {
    fn push_state(&self, url: &Url) {
        self.calls.lock().unwrap().push(HistoryCall::Push(url.clone()));
    }

    fn replace_state(&self, url: &Url) {
        self.calls
            .lock()
            .unwrap()
            .push(HistoryCall::Replace(url.clone()));
    }

    fn assign(&self, url: &Url) {
        self.calls
            .lock()
            .unwrap()
            .push(HistoryCall::Assign(url.clone()));
    }
}

// ******************************
// *        Transitions         *
// ******************************

/// Transition host with configurable feature support and latency.
#[derive(Debug)]
pub struct MemoryTransitions {
    supported: AtomicBool,
    pub fail: AtomicBool,
    latency: Duration,
    started: Mutex<Vec<String>>,
    frames: Mutex<Vec<(String, Transform)>>,
    cleared: AtomicUsize,
}

impl MemoryTransitions {
    pub fn new(supported: bool) -> Self {
        Self {
            supported: AtomicBool::new(supported),
            fail: AtomicBool::new(false),
            latency: Duration::from_millis(200),
            started: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            cleared: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::Relaxed);
    }

    /// Names of the view transitions started so far.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Every fallback frame applied so far.
    pub fn frames(&self) -> Vec<(String, Transform)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::Relaxed)
    }
}

impl TransitionHost for MemoryTransitions {
    fn supports_view_transitions(&self) -> bool {
        self.supported.load(Ordering::Relaxed)
    }

    fn view_transition<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.started.lock().unwrap().push(name.to_string());
            tokio::time::sleep(self.latency).await;
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("transition was skipped");
            }
            Ok(())
        })
    }

    fn apply_transform(&self, target: &str, transform: Transform) -> anyhow::Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("target '{target}' is gone");
        }
        self.frames
            .lock()
            .unwrap()
            .push((target.to_string(), transform));
        Ok(())
    }

    fn clear_transform(&self, _: &str) {
        self.cleared.fetch_add(1, Ordering::Relaxed);
    }
}
