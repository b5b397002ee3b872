//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::broker::{Broker, Delivery};
use super::{Message, TransportError};

#[derive(Debug, Default)]
struct State {
    connected: bool,
    queues: HashMap<String, VecDeque<Message>>,
    unacked: HashMap<u64, Delivery>,
    next_tag: u64,
}

/// In-memory broker.
///
/// Queues live in a single mutex-guarded map; waiting consumers are woken via a
/// shared [`Notify`].
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of declared queues (dead-letter queues included).
    pub fn queue_count(&self) -> usize {
        self.state.lock().map(|s| s.queues.len()).unwrap_or(0)
    }

    /// Deliveries handed out and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.state.lock().map(|s| s.unacked.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Connection("broker lock poisoned".into()))
    }

    fn try_take(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.lock()?;
        if !state.connected {
            return Err(TransportError::Closed);
        }
        let message = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?
            .pop_front();

        let Some(message) = message else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery = Delivery {
            tag: state.next_tag,
            queue: queue.to_string(),
            raw: message.id.to_string(),
            message,
        };
        state.unacked.insert(delivery.tag, delivery.clone());
        Ok(Some(delivery))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        self.lock()?.connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.lock()?;
            state.connected = false;

            let mut pending: Vec<Delivery> = state.unacked.drain().map(|(_, d)| d).collect();
            // Newest first, so the oldest ends up at the very front.
            pending.sort_by(|a, b| b.tag.cmp(&a.tag));
            for delivery in pending {
                if let Some(queue) = state.queues.get_mut(&delivery.queue) {
                    queue.push_front(delivery.message);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn declare(&self, queue: &str) -> Result<bool, TransportError> {
        let mut state = self.lock()?;
        if state.queues.contains_key(queue) {
            return Ok(false);
        }
        state.queues.insert(queue.to_string(), VecDeque::new());
        Ok(true)
    }

    async fn push(&self, queue: &str, message: &Message) -> Result<(), TransportError> {
        {
            let mut state = self.lock()?;
            if !state.connected {
                return Err(TransportError::Closed);
            }
            state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?
                .push_back(message.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before checking, so a push in between is not missed.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_take(queue)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.lock()?.unacked.remove(&delivery.tag);
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, TransportError> {
        self.lock()?
            .queues
            .get(queue)
            .map(VecDeque::len)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }

    async fn peek(&self, queue: &str) -> Result<Vec<Message>, TransportError> {
        self.lock()?
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }
}
