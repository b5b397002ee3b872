//! Redis-backed broker (durable lists, at-least-once delivery).
//!
//! ## Key layout
//!
//! - **Queue**: `{prefix}:queue:{name}` (LPUSH to publish, consumed from the right)
//! - **Processing list**: `{prefix}:processing:{name}`; a delivery is moved here
//!   atomically (`BLMOVE`) and removed on ack (`LREM`)
//! - **Declared set**: `{prefix}:queues`; `SADD` makes declaration idempotent
//!
//! Un-acked deliveries survive a crash in the processing list; `close()` moves
//! them back to the consuming end of their queue.
//!
//! Commands run on blocking connections inside `spawn_blocking`, so a waiting
//! `BLMOVE` never stalls the async runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use super::broker::{Broker, Delivery};
use super::{Message, TransportError};

#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: Arc<redis::Client>,
    prefix: String,
    next_tag: Arc<AtomicU64>,
}

impl RedisBroker {
    /// Create a broker for `redis_url`; keys are namespaced by `prefix`.
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.into(),
            next_tag: Arc::new(AtomicU64::new(0)),
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:processing:{}", self.prefix, queue)
    }

    fn declared_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Run `f` on a fresh blocking connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> Result<T, TransportError> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| TransportError::Connection(format!("blocking task failed: {e}")))?
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), TransportError> {
        let declared_key = self.declared_key();
        let name = queue.to_string();
        let known: bool = self
            .with_conn(move |conn| {
                redis::cmd("SISMEMBER")
                    .arg(&declared_key)
                    .arg(&name)
                    .query(conn)
                    .map_err(|e| TransportError::Command(format!("SISMEMBER failed: {e}")))
            })
            .await?;
        if known {
            Ok(())
        } else {
            Err(TransportError::UnknownQueue(queue.to_string()))
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        let _: String = self
            .with_conn(|conn| {
                redis::cmd("PING")
                    .query(conn)
                    .map_err(|e| TransportError::Connection(e.to_string()))
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let declared_key = self.declared_key();
        let broker = self.clone();
        self.with_conn(move |conn| {
            let queues: Vec<String> = redis::cmd("SMEMBERS")
                .arg(&declared_key)
                .query(conn)
                .map_err(|e| TransportError::Command(format!("SMEMBERS failed: {e}")))?;
            for queue in queues {
                let processing = broker.processing_key(&queue);
                let target = broker.queue_key(&queue);
                // Newest delivery first onto the consuming end, so the oldest
                // is redelivered first.
                loop {
                    let moved: Option<String> = redis::cmd("LMOVE")
                        .arg(&processing)
                        .arg(&target)
                        .arg("LEFT")
                        .arg("RIGHT")
                        .query(conn)
                        .map_err(|e| TransportError::Command(format!("LMOVE failed: {e}")))?;
                    if moved.is_none() {
                        break;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn declare(&self, queue: &str) -> Result<bool, TransportError> {
        let declared_key = self.declared_key();
        let name = queue.to_string();
        let added: i64 = self
            .with_conn(move |conn| {
                redis::cmd("SADD")
                    .arg(&declared_key)
                    .arg(&name)
                    .query(conn)
                    .map_err(|e| TransportError::Declare {
                        queue: name.clone(),
                        reason: e.to_string(),
                    })
            })
            .await?;
        Ok(added == 1)
    }

    async fn push(&self, queue: &str, message: &Message) -> Result<(), TransportError> {
        self.ensure_declared(queue).await?;
        let payload = serde_json::to_string(message).map_err(|e| TransportError::Serialization(e.to_string()))?;
        let key = self.queue_key(queue);
        let _: i64 = self
            .with_conn(move |conn| {
                redis::cmd("LPUSH")
                    .arg(&key)
                    .arg(&payload)
                    .query(conn)
                    .map_err(|e| TransportError::Command(format!("LPUSH failed: {e}")))
            })
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let source = self.queue_key(queue);
        let processing = self.processing_key(queue);
        // A zero timeout would block forever in Redis.
        let seconds = timeout.as_secs_f64().max(0.01);

        let raw: Option<String> = self
            .with_conn(move |conn| {
                redis::cmd("BLMOVE")
                    .arg(&source)
                    .arg(&processing)
                    .arg("RIGHT")
                    .arg("LEFT")
                    .arg(seconds)
                    .query(conn)
                    .map_err(|e| TransportError::Command(format!("BLMOVE failed: {e}")))
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Message>(&raw) {
            Ok(message) => Ok(Some(Delivery {
                tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
                queue: queue.to_string(),
                message,
                raw,
            })),
            Err(e) => {
                // Unreadable entries would be redelivered forever; park them.
                warn!(queue, error = %e, "undecodable message moved to dead letters");
                let dead = self.queue_key(&super::dead_letter_queue(queue));
                let processing = self.processing_key(queue);
                self.with_conn(move |conn| {
                    redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&processing)
                        .arg(1)
                        .arg(&raw)
                        .ignore()
                        .cmd("LPUSH")
                        .arg(&dead)
                        .arg(&raw)
                        .ignore()
                        .query::<()>(conn)
                        .map_err(|e| TransportError::Command(format!("dead-letter failed: {e}")))
                })
                .await?;
                Err(TransportError::Serialization(e.to_string()))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let processing = self.processing_key(&delivery.queue);
        let raw = delivery.raw.clone();
        let _: i64 = self
            .with_conn(move |conn| {
                redis::cmd("LREM")
                    .arg(&processing)
                    .arg(1)
                    .arg(&raw)
                    .query(conn)
                    .map_err(|e| TransportError::Command(format!("LREM failed: {e}")))
            })
            .await?;
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, TransportError> {
        self.ensure_declared(queue).await?;
        let key = self.queue_key(queue);
        self.with_conn(move |conn| {
            redis::cmd("LLEN")
                .arg(&key)
                .query(conn)
                .map_err(|e| TransportError::Command(format!("LLEN failed: {e}")))
        })
        .await
    }

    async fn peek(&self, queue: &str) -> Result<Vec<Message>, TransportError> {
        self.ensure_declared(queue).await?;
        let key = self.queue_key(queue);
        let entries: Vec<String> = self
            .with_conn(move |conn| {
                redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(-1)
                    .query(conn)
                    .map_err(|e| TransportError::Command(format!("LRANGE failed: {e}")))
            })
            .await?;

        // LPUSH stores newest first.
        entries
            .iter()
            .rev()
            .map(|raw| serde_json::from_str(raw).map_err(|e| TransportError::Serialization(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379", "specscout").unwrap();
        assert_eq!(broker.queue_key("results.raw"), "specscout:queue:results.raw");
        assert_eq!(broker.processing_key("results.raw"), "specscout:processing:results.raw");
        assert_eq!(broker.declared_key(), "specscout:queues");
    }

    #[test]
    fn invalid_urls_are_connection_errors() {
        assert!(matches!(
            RedisBroker::new("not a url", "specscout"),
            Err(TransportError::Connection(_))
        ));
    }
}
