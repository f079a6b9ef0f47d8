//! Engine configuration.
//!
//! The theme hands the engine a single JSON object (usually printed into the
//! page by the server-side template). Every field is optional, missing fields
//! fall back to the defaults below. Durations are plain milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Serializes a [`Duration`] as an integer number of milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub routes: RouteConfig,
    pub history: HistoryConfig,
    pub preload: PreloadConfig,
    pub scheduler: SchedulerConfig,
    pub stability: StabilityConfig,
    pub gatekeeper: GatekeeperConfig,
    pub navigation: NavigationConfig,
    pub coordinator: CoordinatorConfig,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// URL patterns and DOM hints used to tell page kinds apart.
///
/// A pattern starting with `?` matches when the query string carries that
/// parameter (`"?p"` matches `/?p=42`). Anything else is a glob matched
/// against the URL path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteConfig {
    pub single: Vec<String>,
    pub page: Vec<String>,
    pub list: Vec<String>,
    /// Attribute on the navigation root carrying an explicit page kind.
    pub kind_attribute: String,
    /// Selector of the container holding a single full article.
    pub article_selector: String,
    /// Selector of the containers of list items (post cards).
    pub item_selector: String,
    /// Selector of the container of a standalone page.
    pub page_selector: String,
    pub memo_capacity: usize,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            single: vec![
                "/archives/*".into(),
                "/post/*".into(),
                "/*.html".into(),
                "?p".into(),
            ],
            page: vec![
                "?page_id".into(),
                "/about*".into(),
                "/links*".into(),
                "/guestbook*".into(),
            ],
            list: vec![
                "/".into(),
                "/page/*".into(),
                "/category/*".into(),
                "/tag/*".into(),
                "/author/*".into(),
                "/search/*".into(),
                "?s".into(),
            ],
            kind_attribute: "data-page-type".into(),
            article_selector: "article.post-full".into(),
            item_selector: "article.post-preview".into(),
            page_selector: "article.page".into(),
            memo_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreloadConfig {
    /// Maximum number of cached pages before the least recently used one is
    /// evicted.
    pub capacity: usize,
    #[serde(with = "millis")]
    pub fetch_timeout: Duration,
    /// Immediate retries after a network error or timeout.
    pub fetch_retries: u32,
    /// Number of forced layout passes on the off-screen copy.
    pub layout_passes: u32,
    pub warm_resources: bool,
    pub max_warmed: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            fetch_timeout: Duration::from_secs(8),
            fetch_retries: 1,
            layout_passes: 2,
            warm_resources: true,
            max_warmed: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(with = "millis")]
    pub task_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub queue_timeout: Duration,
    /// Time slice requested from the idle-time hook before each task.
    #[serde(with = "millis")]
    pub idle_slice: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(5),
            max_retries: 0,
            queue_timeout: Duration::from_secs(30),
            idle_slice: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StabilityConfig {
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    #[serde(with = "millis")]
    pub silent_window: Duration,
    pub required_windows: u32,
    #[serde(with = "millis")]
    pub timeout: Duration,
    pub low_fps_threshold: f64,
    #[serde(with = "millis")]
    pub fps_window: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            silent_window: Duration::from_millis(100),
            required_windows: 3,
            timeout: Duration::from_secs(3),
            low_fps_threshold: 30.0,
            fps_window: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatekeeperConfig {
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    pub score_threshold: f64,
    #[serde(with = "millis")]
    pub admission_poll: Duration,
    #[serde(with = "millis")]
    pub admission_timeout: Duration,
    pub history_capacity: usize,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            score_threshold: 60.0,
            admission_poll: Duration::from_millis(50),
            admission_timeout: Duration::from_secs(1),
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NavigationConfig {
    /// Marker attribute on a clicked card that makes the visit eligible for
    /// a shared-element transition.
    pub shared_element_attribute: String,
    /// Pairs of `(selector, transition name)` given the same name on the
    /// outgoing and incoming page.
    pub shared_elements: Vec<(String, String)>,
    /// Class put on the document root while the old content animates out.
    pub leaving_class: String,
    /// Class put on the document root while the new content animates in.
    pub entering_class: String,
    #[serde(with = "millis")]
    pub cleanup_delay: Duration,
    #[serde(with = "millis")]
    pub enter_duration: Duration,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            shared_element_attribute: "data-shared-element".into(),
            shared_elements: vec![
                (".post-cover".into(), "post-cover".into()),
                (".post-title".into(), "post-title".into()),
            ],
            leaving_class: "is-leaving".into(),
            entering_class: "is-entering".into(),
            cleanup_delay: Duration::from_millis(400),
            enter_duration: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    pub history_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json() {
        let config = Config::from_json(
            r#"{
                "preload": { "capacity": 3, "fetchTimeout": 1500 },
                "stability": { "requiredWindows": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.preload.capacity, 3);
        assert_eq!(config.preload.fetch_timeout, Duration::from_millis(1500));
        assert_eq!(config.preload.layout_passes, 2);
        assert_eq!(config.preload.fetch_retries, 1);
        assert_eq!(config.stability.required_windows, 5);
        assert_eq!(config.history.capacity, 50);
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.routes.kind_attribute, "data-page-type");
        assert_eq!(config.scheduler.queue_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_round_trip_durations_as_millis() {
        let json = serde_json::to_value(SchedulerConfig::default()).unwrap();
        assert_eq!(json["taskTimeout"], 5000);
        assert_eq!(json["idleSlice"], 50);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            Config::from_json("{ nope"),
            Err(ConfigError::Json(_))
        ));
    }
}
