//! Scrape/search facade.
//!
//! `search` and `scrape` start one call each and return a [`CallStream`]: the
//! call's `log`/`progress`/`retry` events in adapter order, then at most one
//! data or error item. Each call has an id; its events are also published on
//! the bus under that id. Dropping the stream cancels the call.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use specscout_core::{ScrapeResult, SearchResult};
use specscout_events::{EventBus, EventPayload, StreamEvent, Subscription};

use crate::devices::Normalizer;
use crate::emit::EventSink;
use crate::jobs::{ExecutionOutcome, TaskExecutor};
use crate::source::{SourceAdapter, SourceRegistry};

/// Failure of a facade call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum ServiceError {
    #[error("unknown source: {name}")]
    UnknownSource { name: String },
    #[error("{message}")]
    Failed { message: String, retries: u32 },
    #[error("normalisation failed: {message}")]
    Normalize { message: String },
}

/// One item of a call stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceItem<T> {
    Event(StreamEvent),
    Data(T),
    Error(ServiceError),
}

/// Live stream of one facade call.
#[derive(Debug)]
pub struct CallStream<T> {
    call_id: String,
    rx: mpsc::UnboundedReceiver<ServiceItem<T>>,
    _cancel_on_drop: DropGuard,
}

impl<T> CallStream<T> {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub async fn next_item(&mut self) -> Option<ServiceItem<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for CallStream<T> {
    type Item = ServiceItem<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Forwards call events to the caller's stream and to the bus.
struct CallSink<T> {
    call_id: String,
    bus: Arc<dyn EventBus>,
    tx: mpsc::UnboundedSender<ServiceItem<T>>,
    seq: AtomicU64,
}

impl<T> CallSink<T> {
    fn deliver(&self, item: ServiceItem<T>) {
        // A closed channel means the caller went away; the call is being cancelled.
        let _ = self.tx.send(item);
    }

    /// Terminal item for an outcome that carries no data.
    fn finish_without_data(&self, outcome: ExecutionOutcome<()>) {
        match outcome {
            ExecutionOutcome::Failed { error, retries, .. } => self.deliver(ServiceItem::Error(ServiceError::Failed {
                message: error,
                retries,
            })),
            ExecutionOutcome::Done { .. } => debug!(call_id = %self.call_id, "call ended without data"),
            ExecutionOutcome::Cancelled { .. } => debug!(call_id = %self.call_id, "call cancelled"),
        }
    }
}

impl<T: Send> EventSink for CallSink<T> {
    fn emit(&self, event: EventPayload) {
        let envelope = StreamEvent::new(self.call_id.clone(), event);
        if let Err(e) = self.bus.publish(envelope.clone()) {
            warn!(call_id = %self.call_id, error = %e, "dropping call event");
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.deliver(ServiceItem::Event(envelope.with_seq(seq)));
    }
}

/// Public entry point for single `search`/`scrape` calls.
#[derive(Clone)]
pub struct ScrapeService {
    sources: SourceRegistry,
    executor: TaskExecutor,
    normalizer: Arc<dyn Normalizer>,
    bus: Arc<dyn EventBus>,
}

impl ScrapeService {
    pub fn new(
        sources: SourceRegistry,
        executor: TaskExecutor,
        normalizer: Arc<dyn Normalizer>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            sources,
            executor,
            normalizer,
            bus,
        }
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Events of a running call, from now on.
    pub fn subscribe(&self, call_id: &str) -> Subscription {
        self.bus.subscribe(call_id)
    }

    fn adapter(&self, source: Option<&str>) -> Result<Arc<dyn SourceAdapter>, ServiceError> {
        self.sources.get(source).ok_or_else(|| ServiceError::UnknownSource {
            name: source.unwrap_or("<default>").to_string(),
        })
    }

    fn open<T: Send + 'static>(&self, kind: &str) -> (CallSink<T>, CallStream<T>, CancellationToken) {
        let call_id = format!("{kind}-{}", Uuid::now_v7());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = CallSink {
            call_id: call_id.clone(),
            bus: Arc::clone(&self.bus),
            tx,
            seq: AtomicU64::new(0),
        };
        let stream = CallStream {
            call_id,
            rx,
            _cancel_on_drop: cancel.clone().drop_guard(),
        };
        (sink, stream, cancel)
    }

    /// Search `source` (or the default source) for `query`.
    pub fn search(&self, query: &str, source: Option<&str>) -> Result<CallStream<Vec<SearchResult>>, ServiceError> {
        let adapter = self.adapter(source)?;
        let (sink, stream, cancel) = self.open("search");
        let executor = self.executor.clone();
        let bus = Arc::clone(&self.bus);
        let query = query.to_string();
        info!(call_id = %stream.call_id(), source = adapter.name(), %query, "search started");

        tokio::spawn(async move {
            match executor.execute(|| adapter.search(&query), &sink, &cancel).await {
                ExecutionOutcome::Done { data: Some(results), .. } => sink.deliver(ServiceItem::Data(results)),
                other => sink.finish_without_data(other.map(|_| ())),
            }
            bus.close(&sink.call_id);
        });
        Ok(stream)
    }

    /// Scrape one device page and normalise it.
    pub fn scrape(&self, slug: &str, source: Option<&str>) -> Result<CallStream<ScrapeResult>, ServiceError> {
        let adapter = self.adapter(source)?;
        let (sink, stream, cancel) = self.open("scrape");
        let executor = self.executor.clone();
        let normalizer = Arc::clone(&self.normalizer);
        let bus = Arc::clone(&self.bus);
        let slug = slug.to_string();
        info!(call_id = %stream.call_id(), source = adapter.name(), %slug, "scrape started");

        tokio::spawn(async move {
            let device = match executor.execute(|| adapter.scrape(&slug), &sink, &cancel).await {
                ExecutionOutcome::Done { data: Some(device), .. } => device,
                other => {
                    sink.finish_without_data(other.map(|_| ()));
                    bus.close(&sink.call_id);
                    return;
                }
            };
            let item = match normalizer.normalize(&device.raw, None).await {
                Ok(data) => ServiceItem::Data(ScrapeResult {
                    slug: device.slug,
                    data,
                    raw: device.raw,
                }),
                Err(e) => ServiceItem::Error(ServiceError::Normalize { message: e.message }),
            };
            sink.deliver(item);
            bus.close(&sink.call_id);
        });
        Ok(stream)
    }
}
