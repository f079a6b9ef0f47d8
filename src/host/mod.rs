//! The browser surfaces the engine consumes, each behind a small trait.
//!
//! Nothing in the engine reaches for a global `document`, `history` or
//! `performance` object. A host (a wasm shim, a headless test harness, an
//! embedding webview) implements these traits and hands them over once in
//! [`Host`]. Traits that suspend return a [`BoxFuture`] so they stay object
//! safe and can be shared as `Arc<dyn _>`.

#[cfg(feature = "http")]
pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchError;
use crate::motion::{Rect, Transform};
use crate::preload::{Fragment, Selector};

/// Same-origin HTTP GET returning the response body as text.
pub trait Fetcher: Send + Sync {
    /// Fetches `url`. Implementations must resolve promptly with
    /// [`FetchError::Cancelled`] once `cancel` fires.
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String, FetchError>>;
}

/// Opaque handle to a fragment attached to the off-screen container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffscreenId(pub u64);

/// Off-screen, non-interactive container used to force layout of a detached
/// page before it is ever shown.
pub trait LayoutHost: Send + Sync {
    fn attach(&self, fragment: &Fragment) -> anyhow::Result<OffscreenId>;

    /// Reads a layout-dependent property (e.g. `offsetHeight`) of the attached
    /// fragment, which forces the host to run a layout pass.
    fn measure(&self, id: OffscreenId) -> anyhow::Result<f64>;

    fn detach(&self, id: OffscreenId);
}

/// The live document.
pub trait Document: Send + Sync {
    /// Value of an attribute on the navigation root, if set.
    fn nav_root_attribute(&self, name: &str) -> Option<String>;

    /// Number of elements currently matching `selector`.
    fn count(&self, selector: &Selector) -> usize;

    /// Swaps the page content for the content of `fragment`.
    fn replace_content(&self, fragment: &Fragment) -> anyhow::Result<()>;

    fn add_class(&self, class: &str);

    fn remove_class(&self, class: &str);

    /// Sets (or with `None` clears) `view-transition-name` on every element
    /// matching `selector`. Returns the number of elements touched.
    fn set_transition_name(&self, selector: &Selector, name: Option<&str>) -> usize;

    /// Viewport box of the first element matching `selector`.
    fn rect(&self, selector: &Selector) -> Option<Rect>;

    fn scroll_offset(&self) -> f64;

    fn scroll_to(&self, offset: f64);

    /// Scrolls the element with the given id into view. Returns `false` when
    /// there is no such element.
    fn scroll_to_anchor(&self, id: &str) -> bool;
}

/// The session history API.
pub trait HistoryApi: Send + Sync {
    fn push_state(&self, url: &Url);

    fn replace_state(&self, url: &Url);

    /// Full page load, the fallback when a soft navigation cannot proceed.
    fn assign(&self, url: &Url);
}

/// Page-transition primitives.
pub trait TransitionHost: Send + Sync {
    /// Feature detection for the platform view-transition primitive.
    fn supports_view_transitions(&self) -> bool;

    /// Runs a platform view transition and resolves when it finishes.
    fn view_transition<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Applies one frame of the interpolation fallback to `target`.
    fn apply_transform(&self, target: &str, transform: Transform) -> anyhow::Result<()>;

    /// Removes any transform left behind on `target`.
    fn clear_transform(&self, target: &str);
}

/// Idle-time scheduling hook (`requestIdleCallback`).
pub trait IdleScheduler: Send + Sync {
    /// Resolves once the host has spare time, at the latest after `slice`.
    fn idle(&self, slice: Duration) -> BoxFuture<'_, ()>;
}

/// Animation-frame scheduling hook (`requestAnimationFrame`).
pub trait FrameClock: Send + Sync {
    fn next_frame(&self) -> BoxFuture<'_, ()>;
}

/// Idle hook on top of the tokio runtime: yield once so every ready task
/// gets to run first.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioIdle;

impl IdleScheduler for TokioIdle {
    fn idle(&self, _: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::task::yield_now())
    }
}

/// Frame clock ticking at a fixed rate on the tokio timer.
#[derive(Debug, Clone, Copy)]
pub struct TokioFrames {
    pub frame: Duration,
}

impl Default for TokioFrames {
    fn default() -> Self {
        Self {
            frame: Duration::from_micros(16_667),
        }
    }
}

impl FrameClock for TokioFrames {
    fn next_frame(&self) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(self.frame))
    }
}

/// Every browser surface the engine needs, handed over once at construction.
#[derive(Clone)]
pub struct Host {
    pub fetcher: Arc<dyn Fetcher>,
    pub layout: Arc<dyn LayoutHost>,
    pub document: Arc<dyn Document>,
    pub history: Arc<dyn HistoryApi>,
    pub transitions: Arc<dyn TransitionHost>,
    pub idle: Arc<dyn IdleScheduler>,
    pub frames: Arc<dyn FrameClock>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Host(*)")
    }
}
