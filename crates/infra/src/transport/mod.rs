//! Message transport: durable queues with bounded retries and dead letters.
//!
//! ## Design
//!
//! - One transport instance is injected into every component (no singleton);
//!   its lifecycle is explicit: `connect()` → `declare_queue()`s → `consume()`s
//!   → `close()`
//! - Every declared queue `q` gets a dead-letter queue `q_dead`
//! - A message is acknowledged exactly once, after its handler finished and the
//!   failure path (requeue or dead-letter) has been applied
//! - Handler failures increment the message's `retries`; below
//!   `message_retries` the message goes back to its own queue, otherwise to
//!   `q_dead`, and an [`ErrorReport`] is published to the error queue
//! - Successful outputs are routed through the [`Pipeline`] registry
//!
//! The `retries` counter is mutated only here, never by handlers.

pub mod broker;
pub mod in_memory;
pub mod pipeline;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use broker::{Broker, Delivery};
pub use in_memory::InMemoryBroker;
pub use pipeline::{NORMALIZE_QUEUE, Pipeline, PipelineStage, RAW_RESULTS_QUEUE};

/// Suffix of the dead-letter queue paired with every declared queue.
pub const DEAD_LETTER_SUFFIX: &str = "_dead";

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Transport-level envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    /// Queue the message was originally published to.
    pub queue: String,
    pub payload: JsonValue,
    /// Failed deliveries so far. Never decreases.
    #[serde(default)]
    pub retries: u32,
    /// Error of the last failed delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            payload,
            retries: 0,
            error: None,
            published_at: Utc::now(),
        }
    }
}

/// Operator-visible record of a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub queue: String,
    pub message_id: Uuid,
    pub retries: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub payload: JsonValue,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("queue {0} already has a consumer")]
    AlreadyConsuming(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("transport is closed")]
    Closed,
}

/// Failure reported by a message handler. Always recoverable via the retry path.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub details: Option<JsonValue>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

/// Processes the payload of one delivered message.
///
/// `Ok(Some(output))` feeds the pipeline stages registered for the queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &JsonValue) -> Result<Option<JsonValue>, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<JsonValue>, HandlerError>> + Send,
{
    FnHandler { f, _fut: PhantomData }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<JsonValue>, HandlerError>> + Send,
{
    async fn handle(&self, payload: &JsonValue) -> Result<Option<JsonValue>, HandlerError> {
        (self.f)(payload.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Failed deliveries before a message is dead-lettered.
    pub message_retries: u32,
    /// Queue receiving an [`ErrorReport`] per dead-lettered message.
    pub error_queue: String,
    /// How long one consumer poll waits before re-checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_retries: 3,
            error_queue: "errors".to_string(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl TransportConfig {
    pub fn with_message_retries(mut self, retries: u32) -> Self {
        self.message_retries = retries.max(1);
        self
    }

    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = queue.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Message transport over a [`Broker`].
pub struct MessageTransport {
    broker: Arc<dyn Broker>,
    config: TransportConfig,
    pipeline: Pipeline,
    declared: Mutex<HashSet<String>>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl MessageTransport {
    pub fn new(broker: Arc<dyn Broker>, config: TransportConfig) -> Self {
        Self {
            broker,
            config,
            pipeline: Pipeline::new(),
            declared: Mutex::new(HashSet::new()),
            consumers: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// In-memory transport for tests/dev.
    pub fn in_memory(config: TransportConfig) -> Self {
        Self::new(Arc::new(InMemoryBroker::new()), config)
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connect the broker and provision the error queue.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.broker.connect().await?;
        if let Ok(mut token) = self.shutdown.lock() {
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.declare_raw(&self.config.error_queue).await?;
        info!(error_queue = %self.config.error_queue, "message transport connected");
        Ok(())
    }

    /// Stop all consumers, then close the broker (un-acked messages are requeued).
    pub async fn close(&self) -> Result<(), TransportError> {
        if let Ok(token) = self.shutdown.lock() {
            token.cancel();
        }
        let handles: Vec<JoinHandle<()>> = match self.consumers.lock() {
            Ok(mut consumers) => consumers.drain().map(|(_, h)| h).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.broker.close().await?;
        info!("message transport closed");
        Ok(())
    }

    /// Idempotently provision `name` and its dead-letter queue.
    ///
    /// Returns `true` when the queue was created by this call.
    #[instrument(skip(self), err)]
    pub async fn declare_queue(&self, name: &str) -> Result<bool, TransportError> {
        if self.is_declared(name) {
            return Ok(false);
        }
        let created = self.declare_raw(name).await?;
        self.declare_raw(&dead_letter_queue(name)).await?;
        if created {
            debug!(queue = name, "queue declared");
        }
        Ok(created)
    }

    async fn declare_raw(&self, name: &str) -> Result<bool, TransportError> {
        let created = self.broker.declare(name).await.map_err(|e| match e {
            TransportError::Declare { .. } => e,
            other => TransportError::Declare {
                queue: name.to_string(),
                reason: other.to_string(),
            },
        })?;
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(name.to_string());
        }
        Ok(created)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared.lock().map(|d| d.contains(name)).unwrap_or(false)
    }

    /// Persist a new message on `queue`.
    #[instrument(skip(self, payload), fields(queue = %queue), err)]
    pub async fn publish(&self, queue: &str, payload: JsonValue) -> Result<Message, TransportError> {
        let message = Message::new(queue, payload);
        self.broker.push(queue, &message).await?;
        Ok(message)
    }

    pub async fn queue_len(&self, queue: &str) -> Result<usize, TransportError> {
        self.broker.len(queue).await
    }

    /// Messages parked in `queue`'s dead-letter queue.
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<Message>, TransportError> {
        self.broker.peek(&dead_letter_queue(queue)).await
    }

    /// Reports published to the error queue.
    pub async fn error_reports(&self) -> Result<Vec<ErrorReport>, TransportError> {
        self.broker
            .peek(&self.config.error_queue)
            .await?
            .into_iter()
            .map(|m| serde_json::from_value(m.payload).map_err(|e| TransportError::Serialization(e.to_string())))
            .collect()
    }

    /// Register the single consumer of `queue`.
    pub fn consume(self: &Arc<Self>, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        if !self.is_declared(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }
        let token = self
            .shutdown
            .lock()
            .map_err(|_| TransportError::Connection("transport lock poisoned".into()))?
            .clone();
        if token.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut consumers = self
            .consumers
            .lock()
            .map_err(|_| TransportError::Connection("transport lock poisoned".into()))?;
        if consumers.get(queue).is_some_and(|h| !h.is_finished()) {
            return Err(TransportError::AlreadyConsuming(queue.to_string()));
        }

        let transport = Arc::clone(self);
        let queue_name = queue.to_string();
        let handle = tokio::spawn(async move {
            transport.consume_loop(queue_name, handler, token).await;
        });
        consumers.insert(queue.to_string(), handle);
        Ok(())
    }

    async fn consume_loop(&self, queue: String, handler: Arc<dyn MessageHandler>, token: CancellationToken) {
        info!(queue = %queue, "consumer started");
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = self.broker.pop(&queue, self.config.poll_interval) => next,
            };
            match next {
                Ok(Some(delivery)) => self.process(delivery, handler.as_ref()).await,
                Ok(None) => continue,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    error!(queue = %queue, error = %e, "failed to receive message");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        info!(queue = %queue, "consumer stopped");
    }

    /// Handle one delivery, apply the retry/dead-letter policy, then acknowledge.
    ///
    /// A delivery whose follow-up writes failed stays un-acked; the broker hands
    /// it back on close or restart.
    #[instrument(skip(self, delivery, handler), fields(queue = %delivery.queue, message_id = %delivery.message.id))]
    async fn process(&self, delivery: Delivery, handler: &dyn MessageHandler) {
        let settled = match handler.handle(&delivery.message.payload).await {
            Ok(Some(output)) => self.chain(&delivery.queue, &output).await,
            Ok(None) => Ok(()),
            Err(err) => self.handle_failure(&delivery, err).await,
        };

        if let Err(e) = settled {
            error!(error = %e, "message left unacknowledged");
            return;
        }
        if let Err(e) = self.broker.ack(&delivery).await {
            error!(error = %e, "failed to acknowledge message");
        }
    }

    async fn chain(&self, queue: &str, output: &JsonValue) -> Result<(), TransportError> {
        for (destination, payload) in self.pipeline.route(queue, output) {
            self.publish(&destination, payload).await.inspect_err(|e| {
                error!(from = queue, to = %destination, error = %e, "pipeline stage publish failed");
            })?;
        }
        Ok(())
    }

    async fn handle_failure(&self, delivery: &Delivery, err: HandlerError) -> Result<(), TransportError> {
        let mut message = delivery.message.clone();
        message.retries += 1;
        message.error = Some(err.message.clone());

        if message.retries < self.config.message_retries {
            warn!(retries = message.retries, error = %err, "handler failed; requeueing");
            return self.broker.push(&delivery.queue, &message).await.inspect_err(|e| {
                error!(error = %e, "failed to requeue message");
            });
        }

        warn!(retries = message.retries, error = %err, "retries exhausted; dead-lettering");
        self.broker
            .push(&dead_letter_queue(&delivery.queue), &message)
            .await
            .inspect_err(|e| error!(error = %e, "failed to dead-letter message"))?;

        // The dead letter is the durable record; a lost report is only logged.
        let report = ErrorReport {
            queue: delivery.queue.clone(),
            message_id: message.id,
            retries: message.retries,
            error: err.message,
            failed_at: Utc::now(),
            payload: message.payload,
        };
        match serde_json::to_value(&report) {
            Ok(value) => {
                if let Err(e) = self.publish(&self.config.error_queue, value).await {
                    error!(error = %e, "failed to publish error report");
                }
            }
            Err(e) => error!(error = %e, "failed to encode error report"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    fn transport(retries: u32) -> Arc<MessageTransport> {
        Arc::new(MessageTransport::in_memory(
            TransportConfig::default()
                .with_message_retries(retries)
                .with_poll_interval(Duration::from_millis(10)),
        ))
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Handler failing its first `failures` invocations.
    fn flaky(failures: u32, calls: Arc<AtomicU32>, successes: Arc<AtomicU32>) -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(move |_payload| {
            let calls = calls.clone();
            let successes = successes.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(HandlerError::new(format!("failure {}", n + 1)))
                } else {
                    successes.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }
        }))
    }

    #[tokio::test]
    async fn declare_queue_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let transport = MessageTransport::new(broker.clone(), TransportConfig::default());
        transport.connect().await.unwrap();

        assert!(transport.declare_queue("scrape").await.unwrap());
        let queues = broker.queue_count();
        assert!(!transport.declare_queue("scrape").await.unwrap());
        assert_eq!(broker.queue_count(), queues);
        assert_eq!(transport.queue_len("scrape_dead").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_fewer_times_than_the_limit_processes_once() {
        let transport = transport(3);
        transport.connect().await.unwrap();
        transport.declare_queue("jobs").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));
        transport.consume("jobs", flaky(2, calls.clone(), successes.clone())).unwrap();
        transport.publish("jobs", json!({ "slug": "a" })).await.unwrap();

        eventually(|| {
            let successes = successes.clone();
            async move { successes.load(Ordering::SeqCst) == 1 }
        })
        .await;
        transport.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(transport.dead_letters("jobs").await.unwrap().is_empty());
        assert!(transport.error_reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn always_failing_handler_dead_letters_after_exactly_the_limit() {
        let transport = transport(3);
        transport.connect().await.unwrap();
        transport.declare_queue("jobs").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        transport
            .consume("jobs", flaky(u32::MAX, calls.clone(), Arc::new(AtomicU32::new(0))))
            .unwrap();
        let published = transport.publish("jobs", json!({ "slug": "a" })).await.unwrap();

        let watch = transport.clone();
        eventually(move || {
            let watch = watch.clone();
            async move { watch.dead_letters("jobs").await.unwrap().len() == 1 }
        })
        .await;
        transport.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let dead = transport.dead_letters("jobs").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, published.id);
        assert_eq!(dead[0].retries, 3);
        assert_eq!(dead[0].error.as_deref(), Some("failure 3"));
        assert_eq!(transport.queue_len("jobs").await.unwrap(), 0);

        let reports = transport.error_reports().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].queue, "jobs");
        assert_eq!(reports[0].message_id, published.id);
    }

    #[tokio::test]
    async fn second_consumer_on_the_same_queue_is_rejected() {
        let transport = transport(3);
        transport.connect().await.unwrap();
        transport.declare_queue("jobs").await.unwrap();

        let handler = flaky(0, Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)));
        transport.consume("jobs", handler.clone()).unwrap();
        assert!(matches!(
            transport.consume("jobs", handler),
            Err(TransportError::AlreadyConsuming(_))
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn successful_outputs_flow_through_pipeline_stages() {
        let transport = Arc::new(
            MessageTransport::in_memory(TransportConfig::default().with_poll_interval(Duration::from_millis(10)))
                .with_pipeline(
                    Pipeline::new()
                        .stage(PipelineStage::forward("options.found", "options.confirm"))
                        .stage(PipelineStage::new("options.confirm", "data.fetch", |v| {
                            Some(json!({ "slug": v["choice"] }))
                        })),
                ),
        );
        transport.connect().await.unwrap();
        for q in ["options.found", "options.confirm", "data.fetch"] {
            transport.declare_queue(q).await.unwrap();
        }

        transport
            .consume("options.found", Arc::new(handler_fn(|p| async move {
                Ok::<_, HandlerError>(Some(json!({ "choice": p["options"][0] })))
            })))
            .unwrap();
        transport
            .consume("options.confirm", Arc::new(handler_fn(|p| async move { Ok::<_, HandlerError>(Some(p)) })))
            .unwrap();
        transport
            .publish("options.found", json!({ "options": ["pixel-9", "pixel-9-pro"] }))
            .await
            .unwrap();

        let watch = transport.clone();
        eventually(move || {
            let watch = watch.clone();
            async move { watch.queue_len("data.fetch").await.unwrap() == 1 }
        })
        .await;
        transport.close().await.unwrap();

        let fetched = transport.broker.peek("data.fetch").await.unwrap();
        assert_eq!(fetched[0].payload, json!({ "slug": "pixel-9" }));
    }

    /// In-memory broker whose requeue writes to one queue fail.
    struct FailingRequeue {
        inner: InMemoryBroker,
        queue: &'static str,
    }

    #[async_trait]
    impl Broker for FailingRequeue {
        async fn connect(&self) -> Result<(), TransportError> {
            self.inner.connect().await
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.inner.close().await
        }

        async fn declare(&self, queue: &str) -> Result<bool, TransportError> {
            self.inner.declare(queue).await
        }

        async fn push(&self, queue: &str, message: &Message) -> Result<(), TransportError> {
            if queue == self.queue && message.retries > 0 {
                return Err(TransportError::Command("READONLY replica".into()));
            }
            self.inner.push(queue, message).await
        }

        async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
            self.inner.pop(queue, timeout).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
            self.inner.ack(delivery).await
        }

        async fn len(&self, queue: &str) -> Result<usize, TransportError> {
            self.inner.len(queue).await
        }

        async fn peek(&self, queue: &str) -> Result<Vec<Message>, TransportError> {
            self.inner.peek(queue).await
        }
    }

    #[tokio::test]
    async fn failed_requeue_leaves_the_message_unacknowledged() {
        let broker = Arc::new(FailingRequeue {
            inner: InMemoryBroker::new(),
            queue: "jobs",
        });
        let transport = Arc::new(MessageTransport::new(
            broker.clone(),
            TransportConfig::default().with_poll_interval(Duration::from_millis(10)),
        ));
        transport.connect().await.unwrap();
        transport.declare_queue("jobs").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        transport
            .consume("jobs", flaky(1, calls.clone(), Arc::new(AtomicU32::new(0))))
            .unwrap();
        let published = transport.publish("jobs", json!({ "slug": "a" })).await.unwrap();

        let inner = broker.clone();
        eventually(move || {
            let inner = inner.clone();
            async move { inner.inner.unacked() == 1 }
        })
        .await;
        transport.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let queued = broker.peek("jobs").await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, published.id);
        assert!(transport.dead_letters("jobs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consume_requires_a_declared_queue() {
        let transport = transport(3);
        transport.connect().await.unwrap();
        let handler = flaky(0, Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)));
        assert!(matches!(
            transport.consume("missing", handler),
            Err(TransportError::UnknownQueue(_))
        ));
    }
}
