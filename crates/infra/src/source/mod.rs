//! Source adapters: pluggable producers of raw search/scrape data.
//!
//! The core never looks inside an adapter. It calls `search`/`scrape`, reads the
//! returned stream and interprets the terminal item:
//!
//! ```text
//! Event(log|progress|retry)* ─▶ Data(result) | Err(typed error) | <end>
//! ```
//!
//! A stream that ends without data is a miss, not a crash.

pub mod http;
pub mod scripted;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use specscout_core::{ScrapedDevice, SearchResult};
use specscout_events::LogLevel;

pub use http::HttpSourceAdapter;
pub use scripted::{ScriptedAdapter, ScriptedAttempt};

/// Informational event yielded by an adapter before its terminal item.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Log {
        level: LogLevel,
        message: String,
    },
    Progress {
        stage: String,
        current: Option<u64>,
        total: Option<u64>,
        message: Option<String>,
    },
    /// The source asked to be retried after `delay` (e.g. rate limiting).
    Retry { delay: Duration, reason: String },
}

impl AdapterEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn stage(stage: impl Into<String>) -> Self {
        Self::Progress {
            stage: stage.into(),
            current: None,
            total: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterItem<T> {
    Event(AdapterEvent),
    Data(T),
}

pub type AdapterStream<T, E> = BoxStream<'static, Result<AdapterItem<T>, E>>;

/// Classification shared by adapter error types.
pub trait AdapterFailure: std::error::Error + Send + Sync + 'static {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// Delay the source asked for, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Typed failure of a `search` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum SearchError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("transient search failure: {message}")]
    Transient { message: String },
    #[error("search timed out: {message}")]
    Timeout { message: String },
    #[error("search failed: {message}")]
    Failed { message: String },
}

/// Typed failure of a `scrape` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum ScrapeError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("transient scrape failure: {message}")]
    Transient { message: String },
    #[error("scrape timed out: {message}")]
    Timeout { message: String },
    #[error("device not found: {slug}")]
    NotFound { slug: String },
    #[error("scrape failed: {message}")]
    Failed { message: String },
}

impl ScrapeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl SearchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}

impl AdapterFailure for SearchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient { .. } | Self::Timeout { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }
}

impl AdapterFailure for ScrapeError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient { .. } | Self::Timeout { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }
}

/// One external source of device data.
pub trait SourceAdapter: Send + Sync {
    /// Stable source name (e.g. "gsmarena").
    fn name(&self) -> &str;

    fn search(&self, query: &str) -> AdapterStream<Vec<SearchResult>, SearchError>;

    fn scrape(&self, slug: &str) -> AdapterStream<ScrapedDevice, ScrapeError>;
}

/// Registered adapters, keyed by source name.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
    default_source: Option<String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. The first one registered becomes the default.
    pub fn register(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        let name = adapter.name().to_string();
        if self.default_source.is_none() {
            self.default_source = Some(name.clone());
        }
        self.adapters.insert(name, adapter);
        self
    }

    /// Adapter for `source`, or the default adapter when `source` is `None`.
    pub fn get(&self, source: Option<&str>) -> Option<Arc<dyn SourceAdapter>> {
        let name = source.or(self.default_source.as_deref())?;
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .field("default_source", &self.default_source)
            .finish()
    }
}
