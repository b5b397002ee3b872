//! Job and task storage.
//!
//! The store is the single source of truth for job and task state: stats are
//! always recomputed from the stored tasks. `claim_next` is atomic, so a task
//! is handed to at most one worker per claim.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use specscout_core::{Entity, Job, JobId, JobStats, Task, TaskId, TaskStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn insert_job(&self, job: Job) -> Result<(), JobStoreError>;

    /// Attach tasks to an existing job.
    fn add_tasks(&self, job_id: JobId, tasks: Vec<Task>) -> Result<(), JobStoreError>;

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update_job(&self, job: &Job) -> Result<(), JobStoreError>;

    /// All jobs, newest first.
    fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError>;

    fn get_task(&self, job_id: JobId, task_id: TaskId) -> Result<Option<Task>, JobStoreError>;

    fn update_task(&self, task: &Task) -> Result<(), JobStoreError>;

    /// Tasks of a job, in creation order.
    fn tasks(&self, job_id: JobId) -> Result<Vec<Task>, JobStoreError>;

    /// Claim the oldest claimable task of a job (`pending → running`).
    /// Returns None if no task is claimable at `now`.
    fn claim_next(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Task>, JobStoreError>;

    /// Earliest scheduled retry among the job's deferred tasks.
    fn next_retry_at(&self, job_id: JobId) -> Result<Option<DateTime<Utc>>, JobStoreError>;

    /// Stats recomputed from the job's tasks.
    fn stats(&self, job_id: JobId) -> Result<JobStats, JobStoreError>;

    /// Error of the most recently failed task.
    fn last_error(&self, job_id: JobId) -> Result<Option<String>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug)]
struct JobRecord {
    job: Job,
    tasks: Vec<Task>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn with_record<R>(&self, job_id: JobId, f: impl FnOnce(&JobRecord) -> R) -> Result<R, JobStoreError> {
        let jobs = self.read()?;
        jobs.get(&job_id).map(f).ok_or(JobStoreError::NotFound(job_id))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let id = *job.id();
        if jobs.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id));
        }
        jobs.insert(id, JobRecord { job, tasks: Vec::new() });
        Ok(())
    }

    fn add_tasks(&self, job_id: JobId, tasks: Vec<Task>) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let record = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        record.tasks.extend(tasks);
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).map(|r| r.job.clone()))
    }

    fn update_job(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let id = *job.id();
        let record = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        record.job = job.clone();
        Ok(())
    }

    fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.read()?.values().map(|r| r.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(jobs)
    }

    fn get_task(&self, job_id: JobId, task_id: TaskId) -> Result<Option<Task>, JobStoreError> {
        self.with_record(job_id, |r| r.tasks.iter().find(|t| *t.id() == task_id).cloned())
    }

    fn update_task(&self, task: &Task) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let record = jobs.get_mut(&task.job_id).ok_or(JobStoreError::NotFound(task.job_id))?;
        let slot = record
            .tasks
            .iter_mut()
            .find(|t| t.id() == task.id())
            .ok_or(JobStoreError::TaskNotFound(*task.id()))?;
        *slot = task.clone();
        Ok(())
    }

    fn tasks(&self, job_id: JobId) -> Result<Vec<Task>, JobStoreError> {
        self.with_record(job_id, |r| r.tasks.clone())
    }

    fn claim_next(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Task>, JobStoreError> {
        let mut jobs = self.write()?;
        let record = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let Some(task) = record.tasks.iter_mut().find(|t| t.is_claimable(now)) else {
            return Ok(None);
        };
        task.claim(now)
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(Some(task.clone()))
    }

    fn next_retry_at(&self, job_id: JobId) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        self.with_record(job_id, |r| {
            r.tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .filter_map(|t| t.next_retry_at)
                .min()
        })
    }

    fn stats(&self, job_id: JobId) -> Result<JobStats, JobStoreError> {
        self.with_record(job_id, |r| JobStats::from_tasks(&r.tasks))
    }

    fn last_error(&self, job_id: JobId) -> Result<Option<String>, JobStoreError> {
        self.with_record(job_id, |r| {
            r.tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Error)
                .max_by_key(|t| t.updated_at)
                .and_then(|t| t.last_error.clone())
        })
    }
}
