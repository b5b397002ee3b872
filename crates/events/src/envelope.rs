use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventPayload;

/// Envelope for a stream event, tagged with the stream it belongs to.
///
/// Notes:
/// - `stream_id` is the key subscribers use: a job id for bulk work, a call id
///   for a single `search`/`scrape` call.
/// - `task` names the originating task (its external id) for task-level events.
/// - `seq` is assigned by the bus and increases monotonically per stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    seq: u64,
    emitted_at: DateTime<Utc>,
    event: EventPayload,
}

impl StreamEvent {
    pub fn new(stream_id: impl Into<String>, event: EventPayload) -> Self {
        Self {
            stream_id: stream_id.into(),
            task: None,
            seq: 0,
            emitted_at: Utc::now(),
            event,
        }
    }

    pub fn with_task(mut self, external_id: impl Into<String>) -> Self {
        self.task = Some(external_id.into());
        self
    }

    /// Override the sequence number (the bus assigns its own on publish).
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn event(&self) -> &EventPayload {
        &self.event
    }

    pub fn into_event(self) -> EventPayload {
        self.event
    }
}
