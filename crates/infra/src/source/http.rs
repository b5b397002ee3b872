//! HTTP source adapter.
//!
//! Delegates the actual vendor work to an external adapter service:
//!
//! - `GET {base}/search?q={query}` → `[SearchResult]`
//! - `GET {base}/scrape/{slug}` → `ScrapedDevice`
//!
//! Status mapping: `429` yields a `retry` event (honouring `Retry-After`) and a
//! `RateLimited` error, `404` is `NotFound`, `5xx` and network errors are
//! `Transient`, anything else is a terminal `Failed`.

use std::time::Duration;

use futures::{StreamExt, stream};
use reqwest::{Response, StatusCode, Url, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use specscout_core::{ScrapedDevice, SearchResult};

use super::{AdapterEvent, AdapterItem, AdapterStream, ScrapeError, SearchError, SourceAdapter};

#[derive(Debug, Clone, PartialEq)]
enum HttpFailure {
    RateLimited(Option<Duration>),
    NotFound,
    Transient(String),
    Failed(String),
}

impl HttpFailure {
    fn from_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited(retry_after),
            StatusCode::NOT_FOUND => Self::NotFound,
            s if s.is_server_error() => Self::Transient(format!("{s}: {body}")),
            s => Self::Failed(format!("{s}: {body}")),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Failed(format!("invalid response body: {err}"))
        } else {
            Self::Transient(err.to_string())
        }
    }

    fn into_scrape_error(self, slug: &str) -> ScrapeError {
        match self {
            Self::RateLimited(after) => ScrapeError::RateLimited {
                message: "source rate limited the request".to_string(),
                retry_after_ms: after.map(|d| d.as_millis() as u64),
            },
            Self::NotFound => ScrapeError::NotFound { slug: slug.to_string() },
            Self::Transient(message) => ScrapeError::Transient { message },
            Self::Failed(message) => ScrapeError::Failed { message },
        }
    }

    fn into_search_error(self) -> SearchError {
        match self {
            Self::RateLimited(after) => SearchError::RateLimited {
                message: "source rate limited the request".to_string(),
                retry_after_ms: after.map(|d| d.as_millis() as u64),
            },
            // An unknown search endpoint is a configuration problem.
            Self::NotFound => SearchError::Failed {
                message: "search endpoint not found".to_string(),
            },
            Self::Transient(message) => SearchError::Transient { message },
            Self::Failed(message) => SearchError::Failed { message },
        }
    }
}

/// `Retry-After` in its delta-seconds form.
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Source adapter backed by an external HTTP adapter service.
#[derive(Debug, Clone)]
pub struct HttpSourceAdapter {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpSourceAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base_url` extended by `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = Url::parse(&self.base_url).map_err(|e| format!("invalid adapter url: {e}"))?;
        url.path_segments_mut()
            .map_err(|_| format!("adapter url cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    #[instrument(skip(client), err(Debug))]
    async fn fetch<T: DeserializeOwned>(client: reqwest::Client, url: String) -> Result<T, HttpFailure> {
        let response: Response = client.get(&url).send().await.map_err(HttpFailure::from_reqwest)?;
        let status = response.status();
        debug!(%status, "adapter service responded");

        if status.is_success() {
            return response.json::<T>().await.map_err(HttpFailure::from_reqwest);
        }

        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()));
        let body = response.text().await.unwrap_or_default();
        Err(HttpFailure::from_status(status, retry_after, body))
    }
}

/// Items yielded for one finished request.
fn items<T, E>(
    result: Result<T, HttpFailure>,
    into_error: impl FnOnce(HttpFailure) -> E,
) -> Vec<Result<AdapterItem<T>, E>> {
    match result {
        Ok(data) => vec![Ok(AdapterItem::Data(data))],
        Err(HttpFailure::RateLimited(Some(delay))) => vec![
            Ok(AdapterItem::Event(AdapterEvent::Retry {
                delay,
                reason: "rate limited by source".to_string(),
            })),
            Err(into_error(HttpFailure::RateLimited(Some(delay)))),
        ],
        Err(failure) => vec![Err(into_error(failure))],
    }
}

impl SourceAdapter for HttpSourceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn search(&self, query: &str) -> AdapterStream<Vec<SearchResult>, SearchError> {
        let client = self.client.clone();
        let url = match self.endpoint(&["search"]) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("q", query);
                url.to_string()
            }
            Err(message) => return stream::iter(vec![Err(SearchError::Failed { message })]).boxed(),
        };
        let started = AdapterEvent::info(format!("searching {} for {query:?}", self.name));

        stream::iter(vec![Ok(AdapterItem::Event(started))])
            .chain(
                stream::once(async move { items(Self::fetch(client, url).await, HttpFailure::into_search_error) })
                    .flat_map(stream::iter),
            )
            .boxed()
    }

    fn scrape(&self, slug: &str) -> AdapterStream<ScrapedDevice, ScrapeError> {
        let client = self.client.clone();
        let url = match self.endpoint(&["scrape", slug]) {
            Ok(url) => url.to_string(),
            Err(message) => return stream::iter(vec![Err(ScrapeError::Failed { message })]).boxed(),
        };
        let owned_slug = slug.to_string();

        stream::iter(vec![Ok(AdapterItem::Event(AdapterEvent::stage("fetch")))])
            .chain(
                stream::once(async move {
                    items(Self::fetch(client, url).await, |f| f.into_scrape_error(&owned_slug))
                })
                .flat_map(stream::iter),
            )
            .boxed()
    }
}
