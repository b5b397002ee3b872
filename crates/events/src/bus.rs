//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** used to stream in-flight work
//! to observers: every event is published under a stream id (a job id or a call
//! id) and delivered to whoever subscribed to that id.
//!
//! ## Design Philosophy
//!
//! - **Keyed fan-out**: subscribers pick one stream id; each gets a copy of every
//!   event published to it after the subscription was created
//! - **No history**: late subscribers do not see earlier events; clients
//!   resynchronise through a job snapshot query, then resume streaming
//! - **Producers never wait**: `publish()` is synchronous and non-blocking. A
//!   slow subscriber loses its *oldest* buffered events (it observes a gap in
//!   `seq`), the producer is never stalled
//! - **Ordered per stream**: events of one stream id arrive in publication order

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::warn;

use crate::envelope::StreamEvent;

/// A subscription to one stream id.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut sub = bus.subscribe(&job_id.to_string());
/// while let Some(event) = sub.recv().await {
///     render(event);
///     if event.event().is_terminal() { break; }
/// }
/// ```
///
/// `recv()` returns `None` once the stream is closed and drained.
#[derive(Debug)]
pub struct Subscription {
    stream_id: String,
    receiver: broadcast::Receiver<StreamEvent>,
    dropped: u64,
}

impl Subscription {
    pub fn new(stream_id: impl Into<String>, receiver: broadcast::Receiver<StreamEvent>) -> Self {
        Self {
            stream_id: stream_id.into(),
            receiver,
            dropped: 0,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Events this subscriber lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next event. Lost events are skipped (and counted).
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(stream_id = %self.stream_id, dropped = n, "subscriber lagged; oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream`, skipping gaps left by backpressure.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let stream_id = self.stream_id;
        BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(stream_id = %stream_id, error = %err, "subscriber lagged; oldest events dropped");
                None
            }
        })
    }
}

/// Bus-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

/// Keyed event bus (pub/sub abstraction).
///
/// ## Architecture Role
///
/// ```text
/// BulkJobManager ── bulk.* ──┐
///                            ├─▶ EventBus ─▶ subscribe(job id) ─▶ RPC stream
/// in-flight tasks ─ log/… ───┘
/// ```
///
/// Only the bulk job manager publishes job-level (`bulk.*`) events, and it does
/// so from inside the job's critical section, so job-level order equals the
/// order of state transitions.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; many workers publish concurrently.
pub trait EventBus: Send + Sync {
    /// Publish an event under its `stream_id`. Never blocks on subscribers.
    fn publish(&self, event: StreamEvent) -> Result<(), BusError>;

    /// Subscribe to future events of `stream_id`.
    fn subscribe(&self, stream_id: &str) -> Subscription;

    /// Close a stream: current subscribers drain their buffers, then end.
    fn close(&self, stream_id: &str);
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, event: StreamEvent) -> Result<(), BusError> {
        (**self).publish(event)
    }

    fn subscribe(&self, stream_id: &str) -> Subscription {
        (**self).subscribe(stream_id)
    }

    fn close(&self, stream_id: &str) {
        (**self).close(stream_id)
    }
}
