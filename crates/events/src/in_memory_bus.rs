//! In-memory event bus.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::bus::{BusError, EventBus, Subscription};
use crate::envelope::StreamEvent;

/// Default per-stream buffer.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Channel {
    tx: broadcast::Sender<StreamEvent>,
    next_seq: u64,
}

/// In-memory keyed pub/sub bus.
///
/// - One bounded broadcast channel per stream id, created on first use
/// - Sequence numbers are assigned under the bus lock, so `seq` order equals
///   publication order
/// - Overflow drops the oldest buffered events of the lagging subscriber only
#[derive(Debug)]
pub struct InMemoryEventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, Channel>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live subscribers on `stream_id`.
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.channels
            .lock()
            .map(|channels| channels.get(stream_id).map_or(0, |c| c.tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Streams with an open channel.
    pub fn stream_count(&self) -> usize {
        self.channels.lock().map(|channels| channels.len()).unwrap_or(0)
    }

    fn channel<'a>(&self, channels: &'a mut HashMap<String, Channel>, stream_id: &str) -> &'a mut Channel {
        channels.entry(stream_id.to_string()).or_insert_with(|| Channel {
            tx: broadcast::channel(self.capacity).0,
            next_seq: 1,
        })
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: StreamEvent) -> Result<(), BusError> {
        let mut channels = self.channels.lock().map_err(|_| BusError::Poisoned)?;
        let channel = self.channel(&mut channels, event.stream_id());

        let seq = channel.next_seq;
        channel.next_seq += 1;

        // No receivers is not an error: there is no history to keep.
        let _ = channel.tx.send(event.with_seq(seq));
        Ok(())
    }

    fn subscribe(&self, stream_id: &str) -> Subscription {
        // If the lock is poisoned we still hand out a subscription; it just
        // never receives anything.
        let receiver = match self.channels.lock() {
            Ok(mut channels) => self.channel(&mut channels, stream_id).tx.subscribe(),
            Err(_) => broadcast::channel(1).1,
        };
        Subscription::new(stream_id, receiver)
    }

    fn close(&self, stream_id: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, LogLevel};

    fn log(stream: &str, n: usize) -> StreamEvent {
        StreamEvent::new(stream, EventPayload::log(LogLevel::Info, format!("line {n}")))
    }

    #[tokio::test]
    async fn delivers_in_publication_order_per_stream() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe("job-1");

        for i in 0..5 {
            bus.publish(log("job-1", i)).unwrap();
        }
        bus.publish(log("job-2", 99)).unwrap();
        bus.close("job-1");

        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            assert_eq!(event.stream_id(), "job-1");
            seqs.push(event.seq());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn late_subscribers_get_no_history() {
        let bus = InMemoryEventBus::new();
        bus.publish(log("job-1", 0)).unwrap();

        let mut sub = bus.subscribe("job-1");
        assert!(sub.try_recv().is_none());

        bus.publish(log("job-1", 1)).unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.seq(), 2);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_without_blocking_publisher() {
        let bus = InMemoryEventBus::with_capacity(4);
        let mut slow = bus.subscribe("job-1");

        // Far more than the buffer; publish must not block.
        for i in 0..20 {
            bus.publish(log("job-1", i)).unwrap();
        }

        let first = slow.recv().await.unwrap();
        assert_eq!(first.seq(), 17);
        assert_eq!(slow.dropped(), 16);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = InMemoryEventBus::new();
        bus.publish(log("nobody", 0)).unwrap();
        assert_eq!(bus.subscriber_count("nobody"), 0);
    }
}
