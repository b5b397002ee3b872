//! Scripted source adapter for tests/dev.
//!
//! Each slug can be given a queue of attempt outcomes; once the queue is empty
//! every further attempt succeeds. Calls are counted per slug, which makes
//! double-claims and lost tasks observable from tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, stream};
use serde_json::json;
use tokio::sync::Semaphore;

use specscout_core::{RawPhoneData, ScrapedDevice, SearchResult};

use super::{AdapterEvent, AdapterItem, AdapterStream, ScrapeError, SearchError, SourceAdapter};

/// Outcome of one scripted `scrape` attempt.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Succeed,
    Fail(ScrapeError),
    /// Yield a `retry` event asking for `delay`, then fail transiently.
    RateLimit { delay: Duration },
    /// Yield events only, then end without data.
    EventsOnly,
    /// Never finish.
    Hang,
}

#[derive(Debug, Default)]
struct Concurrency {
    current: AtomicU32,
    peak: AtomicU32,
}

/// Marks one attempt as in progress until dropped (also when abandoned).
struct InProgress(Arc<Concurrency>);

impl InProgress {
    fn enter(concurrency: Arc<Concurrency>) -> Self {
        let now = concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
        concurrency.peak.fetch_max(now, Ordering::SeqCst);
        Self(concurrency)
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted source adapter.
#[derive(Debug)]
pub struct ScriptedAdapter {
    name: String,
    latency: Duration,
    gate: Option<Arc<Semaphore>>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedAttempt>>>,
    calls: Mutex<HashMap<String, u32>>,
    searches: Mutex<HashMap<String, Vec<SearchResult>>>,
    concurrency: Arc<Concurrency>,
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            gate: None,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
            concurrency: Arc::new(Concurrency::default()),
        }
    }

    /// Delay before each attempt's terminal item.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every attempt consumes one permit of `gate` before finishing; tests
    /// release attempts with `gate.add_permits(n)`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queue attempt outcomes for `slug`.
    pub fn script<I>(&self, slug: &str, attempts: I)
    where
        I: IntoIterator<Item = ScriptedAttempt>,
    {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(slug.to_string()).or_default().extend(attempts);
        }
    }

    pub fn with_search_results(self, query: &str, results: Vec<SearchResult>) -> Self {
        if let Ok(mut searches) = self.searches.lock() {
            searches.insert(query.to_string(), results);
        }
        self
    }

    /// `scrape` attempts made for `slug`.
    pub fn calls(&self, slug: &str) -> u32 {
        self.calls.lock().ok().and_then(|c| c.get(slug).copied()).unwrap_or(0)
    }

    pub fn call_counts(&self) -> HashMap<String, u32> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Highest number of attempts that were in progress at the same time.
    pub fn peak_concurrency(&self) -> u32 {
        self.concurrency.peak.load(Ordering::SeqCst)
    }

    /// Attempts currently in progress.
    pub fn in_progress(&self) -> u32 {
        self.concurrency.current.load(Ordering::SeqCst)
    }

    fn next_attempt(&self, slug: &str) -> ScriptedAttempt {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(slug.to_string()).or_default() += 1;
        }
        self.scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(slug).and_then(VecDeque::pop_front))
            .unwrap_or(ScriptedAttempt::Succeed)
    }

    fn device(&self, slug: &str) -> ScrapedDevice {
        let brand = slug.split('-').next().unwrap_or(slug).to_string();
        ScrapedDevice {
            slug: slug.to_string(),
            html: Some(format!("<html><h1>{slug}</h1></html>")),
            raw: RawPhoneData {
                slug: slug.to_string(),
                source: self.name.clone(),
                name: Some(slug.replace('-', " ")),
                specs: json!({ "brand": brand, "slug": slug }),
                fetched_at: Utc::now(),
            },
        }
    }
}

impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn search(&self, query: &str) -> AdapterStream<Vec<SearchResult>, SearchError> {
        let results = self
            .searches
            .lock()
            .ok()
            .and_then(|s| s.get(query).cloned())
            .unwrap_or_default();
        let events = vec![
            Ok(AdapterItem::Event(AdapterEvent::info(format!("searching {} for {query:?}", self.name)))),
            Ok(AdapterItem::Data(results)),
        ];
        stream::iter(events).boxed()
    }

    fn scrape(&self, slug: &str) -> AdapterStream<ScrapedDevice, ScrapeError> {
        let attempt = self.next_attempt(slug);
        let head = vec![
            Ok(AdapterItem::Event(AdapterEvent::stage("fetch"))),
            Ok(AdapterItem::Event(AdapterEvent::info(format!("fetching {slug}")))),
        ];

        let terminal: Vec<Result<AdapterItem<ScrapedDevice>, ScrapeError>> = match attempt {
            ScriptedAttempt::Hang => return stream::iter(head).chain(stream::pending()).boxed(),
            ScriptedAttempt::Succeed => vec![Ok(AdapterItem::Data(self.device(slug)))],
            ScriptedAttempt::Fail(err) => vec![Err(err)],
            ScriptedAttempt::RateLimit { delay } => vec![
                Ok(AdapterItem::Event(AdapterEvent::Retry {
                    delay,
                    reason: "rate limited".to_string(),
                })),
                Err(ScrapeError::RateLimited {
                    message: "too many requests".to_string(),
                    retry_after_ms: None,
                }),
            ],
            ScriptedAttempt::EventsOnly => vec![Ok(AdapterItem::Event(AdapterEvent::info("nothing found")))],
        };

        let latency = self.latency;
        let gate = self.gate.clone();
        let concurrency = Arc::clone(&self.concurrency);
        let finish = stream::once(async move {
            let _in_progress = InProgress::enter(concurrency);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            stream::iter(terminal)
        })
        .flatten();

        stream::iter(head).chain(finish).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripts_are_consumed_in_order_then_succeed() {
        let adapter = ScriptedAdapter::new("test");
        adapter.script("pixel-9", [ScriptedAttempt::Fail(ScrapeError::transient("503"))]);

        let first: Vec<_> = adapter.scrape("pixel-9").collect().await;
        assert!(matches!(first.last(), Some(Err(ScrapeError::Transient { .. }))));

        let second: Vec<_> = adapter.scrape("pixel-9").collect().await;
        match second.last() {
            Some(Ok(AdapterItem::Data(device))) => assert_eq!(device.raw.specs["brand"], "pixel"),
            other => panic!("expected data, got {other:?}"),
        }
        assert_eq!(adapter.calls("pixel-9"), 2);
    }
}
