//! One unit of work inside a bulk job.
//!
//! Tasks are owned by the bulk job manager: workers report outcomes and the
//! manager applies them here, so every task has a single writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DataKind;
use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Device slug (or vendor id) this task works on.
    #[serde(alias = "slug")]
    pub external_id: String,
    pub source: Option<String>,
    pub data_kind: Option<DataKind>,
    pub status: TaskStatus,
    /// Retries spent across all attempts (first attempt is not a retry).
    pub retries: u32,
    pub last_error: Option<String>,
    /// Set once an attempt sequence ended because every attempt timed out.
    pub timed_out: bool,
    /// Scheduled retry rounds already granted after timeouts.
    pub timeout_rounds: u32,
    /// Earliest time a rescheduled task may be claimed again.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        job_id: JobId,
        external_id: impl Into<String>,
        source: Option<String>,
        data_kind: Option<DataKind>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            job_id,
            external_id: external_id.into(),
            source,
            data_kind,
            status: TaskStatus::Pending,
            retries: 0,
            last_error: None,
            timed_out: false,
            timeout_rounds: 0,
            next_retry_at: None,
            updated_at: now,
        }
    }

    /// Whether a worker may claim this task at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether this task waits on a scheduled retry after timing out.
    pub fn awaits_timeout_retry(&self) -> bool {
        self.status == TaskStatus::Pending && self.next_retry_at.is_some()
    }

    /// `pending → running`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::Pending {
            return Err(DomainError::conflict(format!(
                "task {} is {} and cannot be claimed",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Running;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// `running → done`.
    pub fn complete(&mut self, retries: u32, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_running(TaskStatus::Done)?;
        self.status = TaskStatus::Done;
        self.retries += retries;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// `running → error`; terminal.
    pub fn fail(&mut self, error: impl Into<String>, retries: u32, timed_out: bool, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_running(TaskStatus::Error)?;
        self.status = TaskStatus::Error;
        self.retries += retries;
        self.last_error = Some(error.into());
        self.timed_out = timed_out;
        self.updated_at = now;
        Ok(())
    }

    /// `running → pending` with a not-before time, after an attempt sequence
    /// that only timed out.
    pub fn reschedule_after_timeout(
        &mut self,
        error: impl Into<String>,
        retries: u32,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_running(TaskStatus::Pending)?;
        self.status = TaskStatus::Pending;
        self.retries += retries;
        self.last_error = Some(error.into());
        self.timed_out = true;
        self.timeout_rounds += 1;
        self.next_retry_at = Some(at);
        self.updated_at = now;
        Ok(())
    }

    fn expect_running(&self, to: TaskStatus) -> DomainResult<()> {
        if self.status == TaskStatus::Running {
            Ok(())
        } else {
            Err(DomainError::transition(self.status, to))
        }
    }
}

impl Entity for Task {
    type Id = TaskId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
