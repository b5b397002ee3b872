//! Where in-flight work reports its `log`/`progress`/`retry` events.

use std::sync::Arc;

use tracing::warn;

use specscout_events::{EventBus, EventPayload, StreamEvent};

/// Receiver of events produced by one unit of in-flight work.
///
/// Emitting never blocks and never fails the work: a sink that cannot deliver
/// logs and drops the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EventPayload);
}

/// Publishes events on the bus under a stream id, tagged with the task.
#[derive(Clone)]
pub struct BusSink {
    bus: Arc<dyn EventBus>,
    stream_id: String,
    task: Option<String>,
}

impl BusSink {
    pub fn new(bus: Arc<dyn EventBus>, stream_id: impl Into<String>) -> Self {
        Self {
            bus,
            stream_id: stream_id.into(),
            task: None,
        }
    }

    pub fn for_task(mut self, external_id: impl Into<String>) -> Self {
        self.task = Some(external_id.into());
        self
    }
}

impl EventSink for BusSink {
    fn emit(&self, event: EventPayload) {
        let mut envelope = StreamEvent::new(self.stream_id.clone(), event);
        if let Some(task) = &self.task {
            envelope = envelope.with_task(task.clone());
        }
        if let Err(e) = self.bus.publish(envelope) {
            warn!(stream_id = %self.stream_id, error = %e, "dropping event");
        }
    }
}
