//! Background page preloading.
//!
//! A preloaded page has been fetched, parsed into a detached [`Fragment`],
//! laid out once off-screen and had its images and styles requested, so that
//! when the visit actually happens the swap and the transition math that
//! follows work on a page the host already knows the geometry of.

mod fragment;
mod resources;
mod selector;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use self::fragment::{Element, Fragment, Node, NodeKind};
pub use self::resources::Resources;
pub use self::selector::Selector;

use crate::config::PreloadConfig;
use crate::core::Hash32;
use crate::error::{EngineError, ErrorReporter, FetchError};
use crate::host::{Fetcher, LayoutHost, OffscreenId};
use crate::utils::url_key;

/// A cached page. Cloning is cheap, the heavy parts are shared, so two hits
/// on the same entry hand out the very same fragment.
#[derive(Debug, Clone)]
pub struct PreloadEntry {
    pub url: Url,
    pub html: Arc<str>,
    pub fragment: Arc<Fragment>,
    pub resources: Arc<Resources>,
    pub fingerprint: Hash32,
    pub fetched_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadStats {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
    pub evictions: u64,
    pub warmed: u64,
    pub warm_failures: u64,
}

impl PreloadStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct State {
    cache: LruCache<String, PreloadEntry>,
    stats: PreloadStats,
}

/// Keeps a fragment attached to the off-screen container until dropped.
struct Attached<'a> {
    layout: &'a dyn LayoutHost,
    id: OffscreenId,
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.layout.detach(self.id);
    }
}

pub struct PagePreloader {
    config: PreloadConfig,
    fetcher: Arc<dyn Fetcher>,
    layout: Arc<dyn LayoutHost>,
    reporter: Arc<ErrorReporter>,
    state: Mutex<State>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for PagePreloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePreloader")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PagePreloader {
    pub fn new(
        config: PreloadConfig,
        fetcher: Arc<dyn Fetcher>,
        layout: Arc<dyn LayoutHost>,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            config,
            fetcher,
            layout,
            reporter,
            state: Mutex::new(State {
                cache: LruCache::new(capacity),
                stats: PreloadStats::default(),
            }),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Returns the cached page for `url`, loading it first on a miss.
    ///
    /// Only the fetch can fail the call, which then resolves to `None` after
    /// the failure has been reported. Layout and resource warming are best
    /// effort.
    pub async fn preload(&self, url: &Url) -> Option<PreloadEntry> {
        let key = url_key(url);

        if let Some(entry) = self.lookup(&key) {
            tracing::debug!("preload hit for {key}");
            return Some(entry);
        }

        let cancel = self.cancel.lock().unwrap().child_token();
        let html = self.download(url, &cancel).await?;
        let fingerprint = Hash32::hash(html.as_bytes());

        Some(self.load(url, key, html, fingerprint, &cancel).await)
    }

    /// Fetches `url` again, bypassing the cache. A page whose markup did not
    /// change keeps its cached entry, fragment and all, so no layout pass
    /// runs for it. Anything else is loaded afresh and replaces the entry.
    pub async fn refresh(&self, url: &Url) -> Option<PreloadEntry> {
        let key = url_key(url);
        let cancel = self.cancel.lock().unwrap().child_token();
        let html = self.download(url, &cancel).await?;
        let fingerprint = Hash32::hash(html.as_bytes());

        {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.cache.get_mut(&key)
                && entry.fingerprint == fingerprint
            {
                entry.fetched_at = Instant::now();
                tracing::debug!("{key} unchanged since it was preloaded");
                return Some(entry.clone());
            }
        }

        Some(self.load(url, key, html, fingerprint, &cancel).await)
    }

    /// Preloads several URLs one after the other, skipping those already
    /// cached and stopping once as many pages were loaded as the cache holds.
    /// Returns the number of pages newly loaded.
    pub async fn prefetch(&self, urls: &[Url]) -> usize {
        let mut loaded = 0;

        for url in urls {
            if loaded >= self.config.capacity.max(1) {
                break;
            }
            if self.contains(url) {
                continue;
            }
            if self.preload(url).await.is_some() {
                loaded += 1;
            }
        }

        loaded
    }

    /// Aborts every fetch in flight. Preloads started afterwards are not
    /// affected.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
        tracing::debug!("preloads cancelled");
    }

    /// Cached page for `url` without touching its recency or the stats.
    pub fn peek(&self, url: &Url) -> Option<PreloadEntry> {
        self.state.lock().unwrap().cache.peek(&url_key(url)).cloned()
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.state.lock().unwrap().cache.contains(&url_key(url))
    }

    pub fn invalidate(&self, url: &Url) -> bool {
        self.state.lock().unwrap().cache.pop(&url_key(url)).is_some()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().cache.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PreloadStats {
        self.state.lock().unwrap().stats
    }

    async fn download(&self, url: &Url, cancel: &CancellationToken) -> Option<String> {
        match self.fetch(url, cancel).await {
            Ok(html) => Some(html),
            Err(err) => {
                self.state.lock().unwrap().stats.failures += 1;
                self.reporter.report(err);
                None
            }
        }
    }

    async fn load(
        &self,
        url: &Url,
        key: String,
        html: String,
        fingerprint: Hash32,
        cancel: &CancellationToken,
    ) -> PreloadEntry {
        let started = Instant::now();
        let fragment = Fragment::parse(&html);
        let attached = self.force_layout(&fragment);
        let resources = Resources::extract(&fragment, url);

        if self.config.warm_resources {
            self.warm(&resources, cancel).await;
        }

        let now = Instant::now();
        let entry = PreloadEntry {
            url: url.clone(),
            html: Arc::from(html),
            fragment: Arc::new(fragment),
            resources: Arc::new(resources),
            fingerprint,
            fetched_at: now,
            last_access: now,
            access_count: 0,
        };

        self.insert(key, entry.clone());
        drop(attached);

        tracing::debug!(
            "preloaded {url}: {} nodes, {} resources in {:?}",
            entry.fragment.len(),
            entry.resources.len(),
            started.elapsed()
        );

        entry
    }

    fn lookup(&self, key: &str) -> Option<PreloadEntry> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        match state.cache.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access = Instant::now();
                state.stats.hits += 1;
                Some(entry.clone())
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Fetches with the configured number of immediate retries. Network
    /// errors and timeouts are retried, cancellation and HTTP statuses are not.
    async fn fetch(&self, url: &Url, cancel: &CancellationToken) -> Result<String, FetchError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.fetch_once(url, cancel).await {
                Err(err @ (FetchError::Network(..) | FetchError::Timeout(..)))
                    if attempt <= self.config.fetch_retries && !cancel.is_cancelled() =>
                {
                    tracing::debug!("fetch attempt {attempt} for {url} failed, retrying: {err}");
                }
                result => return result,
            }
        }
    }

    async fn fetch_once(&self, url: &Url, cancel: &CancellationToken) -> Result<String, FetchError> {
        let timeout = self.config.fetch_timeout;
        let attempt = cancel.child_token();

        match tokio::time::timeout(timeout, self.fetcher.fetch(url, attempt.clone())).await {
            Ok(result) => result,
            Err(_) => {
                attempt.cancel();
                Err(FetchError::Timeout(url.to_string(), timeout))
            }
        }
    }

    /// Attaches the fragment off-screen and reads a layout-dependent value
    /// between passes. At least two passes always run.
    fn force_layout(&self, fragment: &Fragment) -> Option<Attached<'_>> {
        let id = match self.layout.attach(fragment) {
            Ok(id) => id,
            Err(err) => {
                self.reporter.report(EngineError::Layout(err));
                return None;
            }
        };

        let attached = Attached {
            layout: self.layout.as_ref(),
            id,
        };

        for pass in 0..self.config.layout_passes.max(2) {
            if let Err(err) = self.layout.measure(id) {
                self.reporter
                    .report(EngineError::Layout(err.context(format!("layout pass {pass}"))));
                break;
            }
        }

        Some(attached)
    }

    async fn warm(&self, resources: &Resources, cancel: &CancellationToken) {
        let requests = resources
            .warmable()
            .take(self.config.max_warmed)
            .map(|url| self.fetcher.fetch(url, cancel.clone()));

        let Ok(results) =
            tokio::time::timeout(self.config.fetch_timeout, futures::future::join_all(requests))
                .await
        else {
            tracing::debug!("resource warming timed out");
            return;
        };

        let warmed = results.iter().filter(|r| r.is_ok()).count() as u64;
        let failed = results.len() as u64 - warmed;

        let mut state = self.state.lock().unwrap();
        state.stats.warmed += warmed;
        state.stats.warm_failures += failed;
    }

    fn insert(&self, key: String, entry: PreloadEntry) {
        let mut state = self.state.lock().unwrap();

        if let Some((evicted, _)) = state.cache.push(key.clone(), entry)
            && evicted != key
        {
            state.stats.evictions += 1;
            tracing::debug!("evicted {evicted} from the preload cache");
        }
    }
}
