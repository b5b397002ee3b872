//! Aggregate job statistics.
//!
//! Stats are derived, never stored: they are recomputed from the task set of a
//! job, so `total == pending + running + done + error` holds for every snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskStatus};

/// Tasks waiting on a scheduled retry after timing out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutStats {
    pub count: u64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub next_retry_external_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub error: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutStats>,
}

impl JobStats {
    /// Recompute stats from a job's tasks.
    pub fn from_tasks<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let mut stats = JobStats::default();
        let mut timeout = TimeoutStats {
            count: 0,
            next_retry_at: None,
            next_retry_external_id: None,
        };

        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Error => stats.error += 1,
            }

            if task.awaits_timeout_retry() {
                timeout.count += 1;
                let earlier = match (task.next_retry_at, timeout.next_retry_at) {
                    (Some(candidate), Some(current)) => candidate < current,
                    (Some(_), None) => true,
                    _ => false,
                };
                if earlier {
                    timeout.next_retry_at = task.next_retry_at;
                    timeout.next_retry_external_id = Some(task.external_id.clone());
                }
            }
        }

        if timeout.count > 0 {
            stats.timeout = Some(timeout);
        }
        stats
    }

    /// The accounting invariant.
    pub fn is_consistent(&self) -> bool {
        self.total == self.pending + self.running + self.done + self.error
    }

    /// No task is waiting for or holding a worker.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}
