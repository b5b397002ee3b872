//! Storage backend behind the message transport.

use std::time::Duration;

use async_trait::async_trait;

use super::{Message, TransportError};

/// One message handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned delivery tag.
    pub tag: u64,
    pub queue: String,
    pub message: Message,
    /// Encoded form as stored by the broker (used to acknowledge).
    pub raw: String,
}

/// Queue storage primitives.
///
/// The broker knows nothing about retries, dead letters or pipelines: those are
/// policies of [`super::MessageTransport`], written once over this trait.
///
/// Delivered messages stay owned by the broker until [`Broker::ack`]; closing
/// the broker returns un-acked deliveries to the head of their queue.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Provision a queue. Returns `true` only when the queue did not exist.
    async fn declare(&self, queue: &str) -> Result<bool, TransportError>;

    async fn push(&self, queue: &str, message: &Message) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message of `queue`.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn len(&self, queue: &str) -> Result<usize, TransportError>;

    /// Messages currently waiting in `queue`, oldest first (non-destructive).
    async fn peek(&self, queue: &str) -> Result<Vec<Message>, TransportError>;
}
