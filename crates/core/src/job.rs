//! Bulk job lifecycle.
//!
//! A `Job` is one declared operation over a filtered set of device targets. Its
//! status follows a small state machine:
//!
//! ```text
//! pending ─start─▶ running ─pause─▶ pausing ─drained─▶ paused ─resume─▶ running
//!                    │                 │
//!                    └──────┬──────────┘
//!                           ▼
//!                      done | error
//! ```
//!
//! `pending`, `done` and `error` cannot be resumed. `completed_at` is set iff the
//! job is terminal and `started_at` is set iff the job ever left `pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DataKind;
use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// What a bulk job does to each of its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scrape,
    ProcessRaw,
    ProcessAi,
    ClearHtml,
    ClearRaw,
    ClearProcessed,
    LinkSource,
}

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::Scrape,
        JobType::ProcessRaw,
        JobType::ProcessAi,
        JobType::ClearHtml,
        JobType::ClearRaw,
        JobType::ClearProcessed,
        JobType::LinkSource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scrape => "scrape",
            JobType::ProcessRaw => "process_raw",
            JobType::ProcessAi => "process_ai",
            JobType::ClearHtml => "clear_html",
            JobType::ClearRaw => "clear_raw",
            JobType::ClearProcessed => "clear_processed",
            JobType::LinkSource => "link_source",
        }
    }

    /// Data kind a clear job removes, if this is a clear job.
    pub fn cleared_kind(&self) -> Option<DataKind> {
        match self {
            JobType::ClearHtml => Some(DataKind::Html),
            JobType::ClearRaw => Some(DataKind::Raw),
            JobType::ClearProcessed => Some(DataKind::Processed),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scrape mode requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Fast,
    Complex,
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Pausing,
    Paused,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Pausing => "pausing",
            JobStatus::Paused => "paused",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a bulk start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub job_type: JobType,
    #[serde(default)]
    pub mode: Option<JobMode>,
    #[serde(default)]
    pub ai_mode: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    /// Explicit targets; when present they replace filter resolution.
    #[serde(default)]
    pub slugs: Option<Vec<String>>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub data_kind: Option<DataKind>,
    #[serde(default)]
    pub worker_count: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            mode: None,
            ai_mode: None,
            filter: None,
            slugs: None,
            source: None,
            data_kind: None,
            worker_count: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_slugs<I, S>(mut self, slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slugs = Some(slugs.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_workers(mut self, worker_count: u32) -> Self {
        self.worker_count = Some(worker_count);
        self
    }

    pub fn with_mode(mut self, mode: JobMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_ai_mode(mut self, ai_mode: impl Into<String>) -> Self {
        self.ai_mode = Some(ai_mode.into());
        self
    }
}

/// A bulk job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub mode: Option<JobMode>,
    pub ai_mode: Option<String>,
    pub status: JobStatus,
    pub filter: String,
    pub slugs: Option<Vec<String>>,
    pub source: Option<String>,
    pub data_kind: Option<DataKind>,
    pub worker_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub total_count: Option<u64>,
    pub queued_count: Option<u64>,
}

/// Filter used when a start request names neither a filter nor slugs.
pub const DEFAULT_FILTER: &str = "all";

impl Job {
    /// Create a pending job from a start request.
    pub fn new(request: NewJob, default_workers: u32, now: DateTime<Utc>) -> DomainResult<Self> {
        let worker_count = request.worker_count.unwrap_or(default_workers);
        if worker_count == 0 {
            return Err(DomainError::validation("workerCount must be positive"));
        }
        if request.job_type == JobType::LinkSource && request.source.is_none() {
            return Err(DomainError::validation("link_source jobs require a source"));
        }
        if let Some(slugs) = &request.slugs {
            if slugs.iter().any(|s| s.trim().is_empty()) {
                return Err(DomainError::validation("slugs must not be blank"));
            }
        }

        let filter = match (&request.filter, &request.slugs) {
            (Some(f), _) if !f.trim().is_empty() => f.trim().to_string(),
            (_, Some(_)) => "slugs".to_string(),
            _ => DEFAULT_FILTER.to_string(),
        };

        Ok(Self {
            id: JobId::new(),
            job_type: request.job_type,
            mode: request.mode,
            ai_mode: request.ai_mode,
            status: JobStatus::Pending,
            filter,
            slugs: request.slugs,
            source: request.source,
            data_kind: request.data_kind.or_else(|| request.job_type.cleared_kind()),
            worker_count,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            total_count: None,
            queued_count: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `pending → running` once the filter resolved to `total` targets.
    pub fn start(&mut self, total: u64, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect(&[JobStatus::Pending], JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.total_count = Some(total);
        self.queued_count = Some(total);
        Ok(())
    }

    /// `running → pausing`; acknowledged before in-flight tasks drain.
    pub fn request_pause(&mut self) -> DomainResult<()> {
        self.expect(&[JobStatus::Running], JobStatus::Pausing)?;
        self.status = JobStatus::Pausing;
        Ok(())
    }

    /// `pausing → paused` after the drain. A running job whose pool was scaled to
    /// zero also settles here.
    pub fn mark_paused(&mut self) -> DomainResult<()> {
        self.expect(&[JobStatus::Pausing, JobStatus::Running], JobStatus::Paused)?;
        self.status = JobStatus::Paused;
        Ok(())
    }

    /// `paused → running`.
    pub fn resume(&mut self) -> DomainResult<()> {
        self.expect(&[JobStatus::Paused], JobStatus::Running)?;
        self.status = JobStatus::Running;
        Ok(())
    }

    /// Rescale the worker pool. Allowed on any started, non-terminal job.
    pub fn set_worker_count(&mut self, worker_count: u32) -> DomainResult<()> {
        match self.status {
            JobStatus::Running | JobStatus::Pausing | JobStatus::Paused => {
                self.worker_count = worker_count;
                Ok(())
            }
            other => Err(DomainError::validation(format!(
                "cannot change workers of a {other} job"
            ))),
        }
    }

    /// Record how many targets are still waiting for a worker.
    pub fn record_queued(&mut self, queued: u64) {
        self.queued_count = Some(queued);
    }

    /// Finish a running (or draining) job with nothing left to dispatch.
    ///
    /// `error_message` decides the outcome: `None` → `done`, `Some` → `error`.
    pub fn complete(&mut self, error_message: Option<String>, now: DateTime<Utc>) -> DomainResult<()> {
        let target = if error_message.is_some() {
            JobStatus::Error
        } else {
            JobStatus::Done
        };
        self.expect(&[JobStatus::Running, JobStatus::Pausing], target)?;
        self.status = target;
        self.error_message = error_message;
        self.completed_at = Some(now);
        self.queued_count = Some(0);
        Ok(())
    }

    /// Abort a non-terminal job (e.g. its filter could not be resolved).
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::transition(self.status, JobStatus::Error));
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = JobStatus::Error;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn expect(&self, allowed: &[JobStatus], to: JobStatus) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition(self.status, to))
        }
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
