use serde::{Deserialize, Serialize};

use specscout_core::{Job, JobStats, JobStatus, TaskId, TaskStatus};

/// Severity of a `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Task reference carried by `bulk.progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub external_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

/// Discriminated payload of a stream event.
///
/// Events are facts: they are never mutated after emission.
/// - `log`, `progress`, `retry`: emitted by in-flight work (one task or one call)
/// - `bulk.*`: emitted by the bulk job manager only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventPayload {
    #[serde(rename = "log")]
    Log { level: LogLevel, message: String },

    #[serde(rename = "progress")]
    Progress {
        stage: String,
        current: Option<u64>,
        total: Option<u64>,
        message: Option<String>,
    },

    #[serde(rename = "retry")]
    Retry {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        reason: String,
    },

    #[serde(rename = "bulk.progress")]
    BulkProgress {
        stats: JobStats,
        task: Option<TaskProgress>,
    },

    #[serde(rename = "bulk.done")]
    BulkDone {
        status: JobStatus,
        stats: JobStats,
        error_message: Option<String>,
    },

    #[serde(rename = "bulk.jobUpdate")]
    BulkJobUpdate { job: Box<Job>, stats: Option<JobStats> },
}

impl EventPayload {
    /// Stable event name (e.g. "bulk.progress").
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Log { .. } => "log",
            EventPayload::Progress { .. } => "progress",
            EventPayload::Retry { .. } => "retry",
            EventPayload::BulkProgress { .. } => "bulk.progress",
            EventPayload::BulkDone { .. } => "bulk.done",
            EventPayload::BulkJobUpdate { .. } => "bulk.jobUpdate",
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        EventPayload::Log {
            level,
            message: message.into(),
        }
    }

    /// Stats snapshot carried by bulk events, if any.
    pub fn stats(&self) -> Option<&JobStats> {
        match self {
            EventPayload::BulkProgress { stats, .. } | EventPayload::BulkDone { stats, .. } => Some(stats),
            EventPayload::BulkJobUpdate { stats, .. } => stats.as_ref(),
            _ => None,
        }
    }

    /// Whether this event ends a bulk job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::BulkDone { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_use_dotted_names() {
        let payload = EventPayload::BulkDone {
            status: JobStatus::Done,
            stats: JobStats::default(),
            error_message: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "bulk.done");
        assert_eq!(value["status"], "done");
        assert!(value["errorMessage"].is_null());

        let retry = EventPayload::Retry {
            attempt: 1,
            max_attempts: 3,
            delay_ms: 250,
            reason: "rate limited".into(),
        };
        let value = serde_json::to_value(&retry).unwrap();
        assert_eq!(value["type"], "retry");
        assert_eq!(value["maxAttempts"], 3);
        assert_eq!(value["delayMs"], 250);
        assert_eq!(serde_json::from_value::<EventPayload>(value).unwrap(), retry);
    }
}
