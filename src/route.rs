//! Page-kind classification.
//!
//! Every URL on the site belongs to one of three kinds: a list of posts, a
//! single post, or a standalone page. The kind decides which transition plays
//! and how scroll position is treated, so the controller asks for it twice per
//! visit: once from the URL before the new page exists (a prediction), and
//! once from the live DOM after the swap (the truth).

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Mutex;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RouteConfig;
use crate::error::ConfigError;
use crate::host::Document;
use crate::preload::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageKind {
    List,
    Single,
    Page,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::List => "list",
            PageKind::Single => "single",
            PageKind::Page => "page",
        }
    }
}

impl FromStr for PageKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" | "home" | "archive" => Ok(PageKind::List),
            "single" | "post" => Ok(PageKind::Single),
            "page" => Ok(PageKind::Page),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for PageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum RoutePattern {
    /// Glob over the URL path.
    Path(Pattern),
    /// Query parameter presence.
    Query(String),
}

impl RoutePattern {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.strip_prefix('?') {
            Some(key) => Ok(RoutePattern::Query(key.to_string())),
            None => Pattern::new(raw)
                .map(RoutePattern::Path)
                .map_err(|err| ConfigError::Pattern(raw.to_string(), err)),
        }
    }

    fn matches(&self, url: &Url) -> bool {
        match self {
            RoutePattern::Path(pattern) => pattern.matches(url.path()),
            RoutePattern::Query(key) => url.query_pairs().any(|(k, _)| k == key.as_str()),
        }
    }
}

/// FIFO-bounded memo of URL classifications.
#[derive(Debug)]
struct Memo {
    capacity: usize,
    order: VecDeque<String>,
    kinds: HashMap<String, PageKind>,
}

impl Memo {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            kinds: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, key: &str) -> Option<PageKind> {
        self.kinds.get(key).copied()
    }

    fn insert(&mut self, key: String, kind: PageKind) {
        if self.capacity == 0 || self.kinds.contains_key(&key) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.kinds.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.kinds.insert(key, kind);
    }
}

/// Maps URLs and the live document to a [`PageKind`].
#[derive(Debug)]
pub struct RouteClassifier {
    single: Vec<RoutePattern>,
    page: Vec<RoutePattern>,
    list: Vec<RoutePattern>,
    kind_attribute: String,
    article: Selector,
    item: Selector,
    standalone: Selector,
    memo: Mutex<Memo>,
}

impl RouteClassifier {
    pub fn new(config: &RouteConfig) -> Result<Self, ConfigError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|raw| RoutePattern::parse(raw))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            single: compile(&config.single)?,
            page: compile(&config.page)?,
            list: compile(&config.list)?,
            kind_attribute: config.kind_attribute.clone(),
            article: Selector::parse(&config.article_selector)?,
            item: Selector::parse(&config.item_selector)?,
            standalone: Selector::parse(&config.page_selector)?,
            memo: Mutex::new(Memo::new(config.memo_capacity)),
        })
    }

    /// Classifies `url` when given one, otherwise the live document.
    pub fn classify(&self, url: Option<&str>, base: Option<&Url>, document: &dyn Document) -> PageKind {
        match url {
            Some(raw) => match crate::utils::resolve(raw, base) {
                Ok(url) => self.classify_url(&url),
                Err(err) => {
                    tracing::debug!("unparseable URL '{raw}' classified as list: {err}");
                    PageKind::List
                }
            },
            None => self.classify_document(document),
        }
    }

    /// Classifies a URL by the ordered pattern groups: single, page, list.
    /// First match wins, no match means list. Results are memoized.
    pub fn classify_url(&self, url: &Url) -> PageKind {
        let key = crate::utils::url_key(url);

        if let Some(kind) = self.memo.lock().unwrap().get(&key) {
            return kind;
        }

        let kind = if self.single.iter().any(|p| p.matches(url)) {
            PageKind::Single
        } else if self.page.iter().any(|p| p.matches(url)) {
            PageKind::Page
        } else {
            // Explicit list patterns only document intent, list is also the
            // fallback.
            if !self.list.iter().any(|p| p.matches(url)) {
                tracing::trace!("no route pattern matched '{url}'");
            }
            PageKind::List
        };

        self.memo.lock().unwrap().insert(key, kind);
        kind
    }

    /// Classifies the live document. Never memoized, the DOM changes under us
    /// on every navigation.
    pub fn classify_document(&self, document: &dyn Document) -> PageKind {
        if let Some(value) = document.nav_root_attribute(&self.kind_attribute) {
            match value.parse() {
                Ok(kind) => return kind,
                Err(()) => tracing::debug!("ignoring unknown page kind '{value}'"),
            }
        }

        let articles = document.count(&self.article);
        let items = document.count(&self.item);

        if articles == 1 && items == 0 {
            PageKind::Single
        } else if items > 1 {
            PageKind::List
        } else if document.count(&self.standalone) > 0 {
            PageKind::Page
        } else {
            PageKind::List
        }
    }
}
