//! Bulk job manager.
//!
//! The manager is the single writer of job and task state. Workers claim tasks
//! and run them, then hand the outcome back to `apply_outcome`; every state
//! change of one job happens inside that job's runtime lock, and so does the
//! publication of the job-level event describing it. Subscribers therefore see
//! `bulk.*` events in the order the transitions happened, and every stats
//! snapshot satisfies `total == pending + running + done + error`.
//!
//! ## Worker pool
//!
//! - `start` spawns `workerCount` workers
//! - a worker exits when the job is not `running` or when more workers are
//!   active than configured (rescale-down never interrupts a task)
//! - `pause` is cooperative: `pausing` until in-flight tasks drain, then `paused`
//! - `resume` restarts the pool at the configured size

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use specscout_core::{DomainError, Job, JobId, JobStats, JobStatus, JobType, NewJob, Task, TaskId, TaskStatus};
use specscout_events::{EventBus, EventPayload, StreamEvent, Subscription, TaskProgress};

use super::runners::{RunnerRegistry, TaskOutcome, TaskRunner};
use super::store::{JobStore, JobStoreError};
use super::targets::{ResolveError, TargetResolver};
use super::types::CompletionPolicy;
use super::worker::run_worker;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Worker count when a start request omits it.
    pub default_workers: u32,
    pub completion: CompletionPolicy,
    /// Delay before a task whose attempts all timed out is retried.
    pub timeout_retry_delay: Duration,
    /// Scheduled retry rounds granted per timed-out task.
    pub timeout_retry_rounds: u32,
    /// Longest an idle worker sleeps before looking for work again.
    pub idle_poll: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_workers: 4,
            completion: CompletionPolicy::default(),
            timeout_retry_delay: Duration::from_secs(60),
            timeout_retry_rounds: 1,
            idle_poll: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("no runner registered for {0} jobs")]
    NoRunner(JobType),
    #[error("job runtime unavailable: {0}")]
    Runtime(String),
}

/// A job together with its derived stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job: Job,
    pub stats: JobStats,
}

/// Result of subscribing to a job's events.
#[derive(Debug)]
pub enum JobSubscription {
    /// The job is still live; `events` yields everything published from now on.
    Live { snapshot: JobSnapshot, events: Subscription },
    /// The job already finished; no further events will be published.
    Finished(JobSnapshot),
}

#[derive(Debug)]
pub(super) struct RuntimeState {
    /// Workers alive for this job (running, idle, or about to exit).
    pub(super) active: u32,
    /// Claimed tasks whose outcome was not applied yet.
    pub(super) in_flight: u32,
    pub(super) last_positive_workers: u32,
    next_worker: u32,
}

/// Per-job coordination: the critical section for state changes plus a wake-up
/// signal for idle workers.
#[derive(Debug)]
pub(super) struct JobRuntime {
    state: Mutex<RuntimeState>,
    pub(super) wake: Notify,
}

impl JobRuntime {
    fn new(worker_count: u32) -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                active: 0,
                in_flight: 0,
                last_positive_workers: worker_count,
                next_worker: 0,
            }),
            wake: Notify::new(),
        }
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, RuntimeState>, ManagerError> {
        self.state
            .lock()
            .map_err(|_| ManagerError::Runtime("job runtime lock poisoned".to_string()))
    }

    /// Reserve `n` worker slots, returning their ids.
    fn reserve(state: &mut RuntimeState, n: u32) -> Vec<u32> {
        state.active += n;
        let first = state.next_worker;
        state.next_worker += n;
        (first..first + n).collect()
    }
}

/// What a worker does next.
pub(super) enum Step {
    Run(Box<Job>, Task),
    Idle(Duration),
    Exit,
}

pub(super) struct ManagerCore {
    store: Arc<dyn JobStore>,
    pub(super) bus: Arc<dyn EventBus>,
    resolver: Arc<dyn TargetResolver>,
    runners: RunnerRegistry,
    config: ManagerConfig,
    runtimes: Mutex<HashMap<JobId, Arc<JobRuntime>>>,
}

/// Owns bulk job lifecycles and their worker pools.
#[derive(Clone)]
pub struct BulkJobManager {
    core: Arc<ManagerCore>,
}

impl BulkJobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn EventBus>,
        resolver: Arc<dyn TargetResolver>,
        runners: RunnerRegistry,
        config: ManagerConfig,
    ) -> Self {
        Self {
            core: Arc::new(ManagerCore {
                store,
                bus,
                resolver,
                runners,
                config,
                runtimes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.core.config
    }

    /// Create a job, resolve its targets and start its worker pool.
    #[instrument(skip(self, request), fields(job_type = %request.job_type), err)]
    pub async fn start(&self, request: NewJob) -> Result<JobSnapshot, ManagerError> {
        let core = &self.core;
        let now = Utc::now();
        let mut job = Job::new(request, core.config.default_workers, now)?;
        if core.runners.get(job.job_type).is_none() {
            return Err(ManagerError::NoRunner(job.job_type));
        }
        core.store.insert_job(job.clone())?;

        // Registered up front so a pending job already accepts subscribers.
        let runtime = Arc::new(JobRuntime::new(job.worker_count));
        core.runtimes
            .lock()
            .map_err(|_| ManagerError::Runtime("runtime registry lock poisoned".to_string()))?
            .insert(job.id, Arc::clone(&runtime));

        let targets = match core.resolver.resolve(&job).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "target resolution failed");
                let _state = runtime.lock()?;
                job.fail(e.to_string(), Utc::now())?;
                core.store.update_job(&job)?;
                core.publish(job.id, job_update(&job, None));
                core.retire(job.id);
                return Err(e.into());
            }
        };

        let workers = {
            let mut state = runtime.lock()?;
            let tasks: Vec<Task> = targets
                .into_iter()
                .map(|t| Task::new(job.id, t.external_id, t.source, t.data_kind, now))
                .collect();
            let total = tasks.len() as u64;
            core.store.add_tasks(job.id, tasks)?;
            job.start(total, Utc::now())?;
            core.store.update_job(&job)?;
            info!(job_id = %job.id, total, workers = job.worker_count, filter = %job.filter, "bulk job started");

            let stats = core.store.stats(job.id)?;
            core.publish(job.id, job_update(&job, Some(stats.clone())));
            if total == 0 {
                core.complete_job(job.clone(), &stats)?;
                Vec::new()
            } else {
                JobRuntime::reserve(&mut state, job.worker_count)
            }
        };
        core.spawn_workers(&runtime, job.id, workers);

        self.get(job.id)
    }

    /// Request a cooperative pause.
    #[instrument(skip(self), err)]
    pub async fn pause(&self, job_id: JobId) -> Result<Job, ManagerError> {
        let runtime = self.core.runtime_of(job_id)?;
        let job = {
            let state = runtime.lock()?;
            let mut job = self.core.job(job_id)?;
            job.request_pause()?;
            if state.in_flight == 0 {
                job.mark_paused()?;
            }
            self.core.save_and_announce(&job)?;
            info!(job_id = %job_id, status = %job.status, in_flight = state.in_flight, "pause requested");
            job
        };
        runtime.wake.notify_waiters();
        Ok(job)
    }

    /// Restart a paused job's worker pool.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, job_id: JobId) -> Result<Job, ManagerError> {
        let runtime = self.core.runtime_of(job_id)?;
        let (job, workers) = {
            let mut state = runtime.lock()?;
            let mut job = self.core.job(job_id)?;
            job.resume()?;
            if job.worker_count == 0 {
                job.set_worker_count(state.last_positive_workers.max(1))?;
            }
            self.core.save_and_announce(&job)?;
            let missing = job.worker_count.saturating_sub(state.active);
            info!(job_id = %job_id, workers = job.worker_count, spawned = missing, "bulk job resumed");
            (job, JobRuntime::reserve(&mut state, missing))
        };
        self.core.spawn_workers(&runtime, job_id, workers);
        runtime.wake.notify_waiters();
        Ok(job)
    }

    /// Rescale the worker pool. Excess workers exit after their current task.
    #[instrument(skip(self), err)]
    pub async fn set_workers(&self, job_id: JobId, worker_count: u32) -> Result<Job, ManagerError> {
        let runtime = self.core.runtime_of(job_id)?;
        let (job, workers) = {
            let mut state = runtime.lock()?;
            let mut job = self.core.job(job_id)?;
            job.set_worker_count(worker_count)?;
            if worker_count > 0 {
                state.last_positive_workers = worker_count;
            }

            let mut workers = Vec::new();
            if job.status == JobStatus::Running {
                if worker_count > state.active {
                    let missing = worker_count - state.active;
                    workers = JobRuntime::reserve(&mut state, missing);
                } else if worker_count == 0 && state.active == 0 && state.in_flight == 0 {
                    job.mark_paused()?;
                }
            }
            self.core.save_and_announce(&job)?;
            info!(job_id = %job_id, workers = worker_count, active = state.active, "worker pool rescaled");
            (job, workers)
        };
        self.core.spawn_workers(&runtime, job_id, workers);
        runtime.wake.notify_waiters();
        Ok(job)
    }

    /// All retained jobs, newest first.
    pub fn list(&self) -> Result<Vec<JobSnapshot>, ManagerError> {
        self.core
            .store
            .list_jobs()?
            .into_iter()
            .map(|job| {
                let stats = self.core.store.stats(job.id)?;
                Ok(JobSnapshot { job, stats })
            })
            .collect()
    }

    pub fn get(&self, job_id: JobId) -> Result<JobSnapshot, ManagerError> {
        let job = self.core.job(job_id)?;
        let stats = self.core.store.stats(job_id)?;
        Ok(JobSnapshot { job, stats })
    }

    /// Subscribe to a job's events from now on.
    pub fn subscribe(&self, job_id: JobId) -> Result<JobSubscription, ManagerError> {
        self.core.job(job_id)?;
        let Some(runtime) = self.core.try_runtime(job_id)? else {
            return Ok(JobSubscription::Finished(self.get(job_id)?));
        };

        // Completion publishes and closes the stream under this lock.
        let _state = runtime.lock()?;
        let snapshot = self.get(job_id)?;
        if snapshot.job.is_terminal() {
            return Ok(JobSubscription::Finished(snapshot));
        }
        let events = self.core.bus.subscribe(&job_id.to_string());
        Ok(JobSubscription::Live { snapshot, events })
    }

    /// Workers currently alive for a job (0 once it finished).
    pub fn active_workers(&self, job_id: JobId) -> Result<u32, ManagerError> {
        match self.core.try_runtime(job_id)? {
            Some(runtime) => Ok(runtime.lock()?.active),
            None => Ok(0),
        }
    }
}

fn job_update(job: &Job, stats: Option<JobStats>) -> EventPayload {
    EventPayload::BulkJobUpdate {
        job: Box::new(job.clone()),
        stats,
    }
}

impl ManagerCore {
    pub(super) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(super) fn runner(&self, job_type: JobType) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(job_type)
    }

    fn job(&self, job_id: JobId) -> Result<Job, ManagerError> {
        self.store.get_job(job_id)?.ok_or(ManagerError::NotFound(job_id))
    }

    fn try_runtime(&self, job_id: JobId) -> Result<Option<Arc<JobRuntime>>, ManagerError> {
        Ok(self
            .runtimes
            .lock()
            .map_err(|_| ManagerError::Runtime("runtime registry lock poisoned".to_string()))?
            .get(&job_id)
            .cloned())
    }

    /// Runtime of a live job. Finished jobs have none; their lifecycle calls
    /// fail with the job's own transition error.
    fn runtime_of(&self, job_id: JobId) -> Result<Arc<JobRuntime>, ManagerError> {
        if let Some(runtime) = self.try_runtime(job_id)? {
            return Ok(runtime);
        }
        let job = self.job(job_id)?;
        Err(DomainError::Conflict(format!("job {job_id} is {} and can no longer change", job.status)).into())
    }

    fn publish(&self, job_id: JobId, payload: EventPayload) {
        if let Err(e) = self.bus.publish(StreamEvent::new(job_id.to_string(), payload)) {
            warn!(job_id = %job_id, error = %e, "failed to publish job event");
        }
    }

    fn save_and_announce(&self, job: &Job) -> Result<(), ManagerError> {
        self.store.update_job(job)?;
        let stats = self.store.stats(job.id)?;
        self.publish(job.id, job_update(job, Some(stats)));
        Ok(())
    }

    pub(super) fn spawn_workers(self: &Arc<Self>, runtime: &Arc<JobRuntime>, job_id: JobId, workers: Vec<u32>) {
        for worker in workers {
            tokio::spawn(run_worker(Arc::clone(self), Arc::clone(runtime), job_id, worker));
        }
    }

    /// Decide a worker's next step. Called by workers only.
    pub(super) fn next_step(&self, runtime: &JobRuntime, job_id: JobId) -> Result<Step, ManagerError> {
        let mut state = runtime.lock()?;
        let mut job = self.job(job_id)?;

        if job.status != JobStatus::Running || state.active > job.worker_count {
            state.active = state.active.saturating_sub(1);
            let drained = state.in_flight == 0
                && (job.status == JobStatus::Pausing
                    || (job.status == JobStatus::Running && job.worker_count == 0 && state.active == 0));
            if drained {
                job.mark_paused()?;
                self.save_and_announce(&job)?;
                info!(job_id = %job_id, "bulk job paused");
            }
            return Ok(Step::Exit);
        }

        let now = Utc::now();
        if let Some(task) = self.store.claim_next(job_id, now)? {
            state.in_flight += 1;
            return Ok(Step::Run(Box::new(job), task));
        }

        let stats = self.store.stats(job_id)?;
        if stats.is_settled() && state.in_flight == 0 {
            state.active = state.active.saturating_sub(1);
            self.complete_job(job, &stats)?;
            return Ok(Step::Exit);
        }

        let mut wait = self.config.idle_poll;
        if let Some(at) = self.store.next_retry_at(job_id)? {
            if let Ok(until) = (at - now).to_std() {
                wait = wait.min(until);
            }
        }
        Ok(Step::Idle(wait))
    }

    /// Apply a worker's outcome for one task. The only writer of task state
    /// after a claim.
    pub(super) fn apply_outcome(
        &self,
        runtime: &JobRuntime,
        job_id: JobId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<(), ManagerError> {
        let mut state = runtime.lock()?;
        state.in_flight = state.in_flight.saturating_sub(1);

        let now = Utc::now();
        let mut task = self
            .store
            .get_task(job_id, task_id)?
            .ok_or(JobStoreError::TaskNotFound(task_id))?;
        let applied = match outcome {
            TaskOutcome::Done { retries } => task.complete(retries, now),
            TaskOutcome::Failed {
                error,
                retries,
                timed_out: true,
            } if task.timeout_rounds < self.config.timeout_retry_rounds => {
                let at = now
                    + chrono::Duration::from_std(self.config.timeout_retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                task.reschedule_after_timeout(error, retries, at, now)
            }
            TaskOutcome::Failed {
                error,
                retries,
                timed_out,
            } => task.fail(error, retries, timed_out, now),
        };
        if let Err(e) = applied {
            warn!(job_id = %job_id, task_id = %task_id, error = %e, "discarding task outcome");
            return Ok(());
        }
        self.store.update_task(&task)?;
        debug!(job_id = %job_id, task = %task.external_id, status = %task.status, retries = task.retries, "task outcome applied");

        let stats = self.store.stats(job_id)?;
        let mut job = self.job(job_id)?;
        job.record_queued(stats.pending);
        self.store.update_job(&job)?;
        self.publish(
            job_id,
            EventPayload::BulkProgress {
                stats: stats.clone(),
                task: Some(TaskProgress {
                    task_id: task.id,
                    external_id: task.external_id.clone(),
                    status: task.status,
                    error: task.last_error.clone().filter(|_| task.status != TaskStatus::Done),
                }),
            },
        );

        if state.in_flight == 0 {
            if stats.is_settled() && matches!(job.status, JobStatus::Running | JobStatus::Pausing) {
                self.complete_job(job, &stats)?;
            } else if job.status == JobStatus::Pausing {
                job.mark_paused()?;
                self.save_and_announce(&job)?;
                info!(job_id = %job_id, "bulk job paused");
            }
        }
        Ok(())
    }

    /// Finish a job whose tasks all settled. Caller holds the runtime lock.
    fn complete_job(&self, mut job: Job, stats: &JobStats) -> Result<(), ManagerError> {
        let error_message = if stats.error > 0 {
            let last_error = self.store.last_error(job.id)?;
            self.config
                .completion
                .evaluate(stats.error, stats.total, last_error.as_deref())
        } else {
            None
        };
        job.complete(error_message, Utc::now())?;
        self.store.update_job(&job)?;
        info!(
            job_id = %job.id,
            status = %job.status,
            done = stats.done,
            error = stats.error,
            "bulk job finished"
        );

        self.publish(job.id, job_update(&job, Some(stats.clone())));
        self.publish(
            job.id,
            EventPayload::BulkDone {
                status: job.status,
                stats: stats.clone(),
                error_message: job.error_message.clone(),
            },
        );
        self.retire(job.id);
        Ok(())
    }

    /// Close a finished job's event stream and drop its runtime.
    fn retire(&self, job_id: JobId) {
        self.bus.close(&job_id.to_string());
        if let Ok(mut runtimes) = self.runtimes.lock() {
            runtimes.remove(&job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::Semaphore;

    use specscout_events::InMemoryEventBus;

    use super::*;
    use crate::devices::{InMemoryDeviceStore, PassthroughNormalizer};
    use crate::jobs::executor::{ExecutorConfig, TaskExecutor};
    use crate::jobs::runners::RunnerContext;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::targets::{StaticTargetResolver, StoreTargetResolver, Target};
    use crate::jobs::types::RetryPolicy;
    use crate::source::{ScrapeError, ScriptedAdapter, ScriptedAttempt, SourceRegistry};

    struct Harness {
        manager: BulkJobManager,
        adapter: Arc<ScriptedAdapter>,
    }

    fn harness_with(
        adapter: ScriptedAdapter,
        resolver: Arc<dyn TargetResolver>,
        executor: ExecutorConfig,
        config: ManagerConfig,
    ) -> Harness {
        let adapter = Arc::new(adapter);
        let ctx = RunnerContext::new(
            TaskExecutor::new(executor),
            SourceRegistry::new().register(adapter.clone()),
            Arc::new(InMemoryDeviceStore::new()),
            Arc::new(PassthroughNormalizer),
        );
        let manager = BulkJobManager::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryEventBus::with_capacity(4096)),
            resolver,
            RunnerRegistry::standard(ctx),
            config,
        );
        Harness { manager, adapter }
    }

    fn fast_executor() -> ExecutorConfig {
        ExecutorConfig {
            timeout: Duration::from_secs(2),
            retry: RetryPolicy::fixed(3, Duration::from_millis(5)),
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            idle_poll: Duration::from_millis(10),
            ..ManagerConfig::default()
        }
    }

    fn slugs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("device-{i}")).collect()
    }

    fn harness(adapter: ScriptedAdapter, n: usize) -> Harness {
        let resolver = StaticTargetResolver::new().with_filter("unscraped", slugs(n));
        harness_with(adapter, Arc::new(resolver), fast_executor(), fast_config())
    }

    fn scrape(workers: u32) -> NewJob {
        NewJob::new(JobType::Scrape).with_filter("unscraped").with_workers(workers)
    }

    async fn wait_for(manager: &BulkJobManager, job_id: JobId, status: JobStatus) -> JobSnapshot {
        for _ in 0..500 {
            let snapshot = manager.get(job_id).unwrap();
            if snapshot.job.status == status {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    async fn collect_until_done(events: &mut Subscription) -> Vec<StreamEvent> {
        let mut seen = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event stream stalled")
        {
            let done = event.event().is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    fn live(subscription: JobSubscription) -> Subscription {
        match subscription {
            JobSubscription::Live { events, .. } => events,
            JobSubscription::Finished(s) => panic!("job already finished: {:?}", s.job.status),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unscraped_filter_runs_every_target() {
        let h = harness(ScriptedAdapter::new("gsmarena"), 3);
        let started = h.manager.start(scrape(2)).await.unwrap();
        assert_eq!(started.job.total_count, Some(3));

        let done = wait_for(&h.manager, started.job.id, JobStatus::Done).await;
        assert_eq!(
            (done.stats.total, done.stats.done, done.stats.pending, done.stats.running, done.stats.error),
            (3, 3, 0, 0, 0)
        );
        assert!(done.job.completed_at.is_some());
        assert_eq!(done.job.queued_count, Some(0));
        assert_eq!(h.manager.active_workers(started.job.id).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retryable_failures_emit_one_retry_event_each() {
        let h = harness(ScriptedAdapter::new("gsmarena").with_latency(Duration::from_millis(30)), 1);
        h.adapter.script(
            "device-0",
            [
                ScriptedAttempt::Fail(ScrapeError::transient("502")),
                ScriptedAttempt::Fail(ScrapeError::transient("503")),
            ],
        );

        let started = h.manager.start(scrape(1)).await.unwrap();
        let mut events = live(h.manager.subscribe(started.job.id).unwrap());
        let seen = collect_until_done(&mut events).await;

        let retries: Vec<_> = seen
            .iter()
            .filter(|e| matches!(e.event(), EventPayload::Retry { .. }))
            .collect();
        assert_eq!(retries.len(), 2);
        assert!(retries.iter().all(|e| e.task() == Some("device-0")));

        let snapshot = h.manager.get(started.job.id).unwrap();
        assert_eq!(snapshot.job.status, JobStatus::Done);
        assert_eq!(snapshot.stats.done, 1);
        assert_eq!(h.adapter.calls("device-0"), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_event_satisfies_the_accounting_invariant() {
        let h = harness(ScriptedAdapter::new("gsmarena").with_latency(Duration::from_millis(15)), 12);
        h.adapter.script("device-3", [ScriptedAttempt::Fail(ScrapeError::failed("parse error"))]);

        let started = h.manager.start(scrape(3)).await.unwrap();
        let mut events = live(h.manager.subscribe(started.job.id).unwrap());
        let seen = collect_until_done(&mut events).await;

        let mut last_seq = 0;
        for event in &seen {
            assert!(event.seq() > last_seq, "events out of order");
            last_seq = event.seq();
            if let Some(stats) = event.event().stats() {
                assert!(stats.is_consistent(), "inconsistent stats: {stats:?}");
                assert_eq!(stats.total, 12);
            }
        }
        let progress = seen
            .iter()
            .filter(|e| matches!(e.event(), EventPayload::BulkProgress { .. }))
            .count();
        assert!(progress >= 1);
        assert!(matches!(
            seen.last().map(|e| e.event()),
            Some(EventPayload::BulkDone { status: JobStatus::Error, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rescale_down_converges_without_losing_tasks() {
        let h = harness(ScriptedAdapter::new("gsmarena").with_latency(Duration::from_millis(40)), 10);
        let started = h.manager.start(scrape(4)).await.unwrap();
        let job_id = started.job.id;

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.manager.set_workers(job_id, 1).await.unwrap();

        let mut converged = false;
        for _ in 0..200 {
            let snapshot = h.manager.get(job_id).unwrap();
            if snapshot.job.is_terminal() {
                break;
            }
            if h.manager.active_workers(job_id).unwrap() == 1 {
                converged = true;
                assert!(h.adapter.in_progress() <= 1);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(converged, "pool never shrank to one worker");

        let done = wait_for(&h.manager, job_id, JobStatus::Done).await;
        assert_eq!(done.stats.done, 10);
        let calls = h.adapter.call_counts();
        assert_eq!(calls.len(), 10);
        assert!(calls.values().all(|c| *c == 1), "a task ran twice: {calls:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_workers_never_share_a_task() {
        let h = harness(ScriptedAdapter::new("gsmarena").with_latency(Duration::from_millis(2)), 50);
        let started = h.manager.start(scrape(8)).await.unwrap();
        let mut events = live(h.manager.subscribe(started.job.id).unwrap());
        let seen = collect_until_done(&mut events).await;

        let mut reported = HashSet::new();
        for event in &seen {
            if let EventPayload::BulkProgress { task: Some(task), .. } = event.event() {
                assert!(reported.insert(task.task_id), "outcome reported twice for {}", task.external_id);
            }
        }
        assert!(h.adapter.call_counts().values().all(|c| *c == 1));
        assert!(h.adapter.peak_concurrency() <= 8);
        assert_eq!(h.manager.get(started.job.id).unwrap().stats.done, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pause_waits_for_in_flight_tasks() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedAdapter::new("gsmarena").with_gate(gate.clone()), 6);
        let started = h.manager.start(scrape(2)).await.unwrap();
        let job_id = started.job.id;

        for _ in 0..200 {
            if h.adapter.in_progress() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.adapter.in_progress(), 2);

        let paused = h.manager.pause(job_id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Pausing);

        gate.add_permits(2);
        let snapshot = wait_for(&h.manager, job_id, JobStatus::Paused).await;
        assert_eq!(snapshot.stats.done, 2);
        assert_eq!(snapshot.stats.pending, 4);
        assert_eq!(snapshot.stats.running, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.adapter.call_counts().len(), 2, "claimed while pausing");

        gate.add_permits(100);
        let resumed = h.manager.resume(job_id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        let done = wait_for(&h.manager, job_id, JobStatus::Done).await;
        assert_eq!(done.stats.done, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scaling_to_zero_settles_as_paused() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedAdapter::new("gsmarena").with_gate(gate.clone()), 2);
        let started = h.manager.start(scrape(1)).await.unwrap();
        let job_id = started.job.id;

        h.manager.set_workers(job_id, 0).await.unwrap();
        gate.add_permits(1);
        let snapshot = wait_for(&h.manager, job_id, JobStatus::Paused).await;
        assert_eq!(snapshot.job.worker_count, 0);

        gate.add_permits(10);
        let resumed = h.manager.resume(job_id).await.unwrap();
        assert_eq!(resumed.worker_count, 1);
        wait_for(&h.manager, job_id, JobStatus::Done).await;

        let err = h.manager.pause(job_id).await.unwrap_err();
        assert!(matches!(err, ManagerError::Domain(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_policy_decides_the_final_status() {
        let resolver = Arc::new(StaticTargetResolver::new().with_filter("unscraped", slugs(4)));
        let strict = harness_with(ScriptedAdapter::new("gsmarena"), resolver.clone(), fast_executor(), fast_config());
        strict
            .adapter
            .script("device-1", [ScriptedAttempt::Fail(ScrapeError::NotFound { slug: "device-1".into() })]);

        let job = strict.manager.start(scrape(2)).await.unwrap().job;
        let failed = wait_for(&strict.manager, job.id, JobStatus::Error).await;
        assert_eq!(
            failed.job.error_message.as_deref(),
            Some("1 of 4 tasks failed: device not found: device-1")
        );
        assert_eq!((failed.stats.done, failed.stats.error), (3, 1));

        let lenient = harness_with(
            ScriptedAdapter::new("gsmarena"),
            resolver,
            fast_executor(),
            ManagerConfig {
                completion: CompletionPolicy::lenient(),
                ..fast_config()
            },
        );
        lenient
            .adapter
            .script("device-1", [ScriptedAttempt::Fail(ScrapeError::NotFound { slug: "device-1".into() })]);
        let job = lenient.manager.start(scrape(2)).await.unwrap().job;
        let done = wait_for(&lenient.manager, job.id, JobStatus::Done).await;
        assert_eq!(done.job.error_message, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timed_out_tasks_are_rescheduled_once() {
        let resolver = Arc::new(StaticTargetResolver::new().with_filter("unscraped", slugs(1)));
        let h = harness_with(
            ScriptedAdapter::new("gsmarena"),
            resolver,
            ExecutorConfig {
                timeout: Duration::from_millis(20),
                retry: RetryPolicy::fixed(1, Duration::from_millis(1)),
            },
            ManagerConfig {
                timeout_retry_delay: Duration::from_millis(100),
                timeout_retry_rounds: 1,
                ..fast_config()
            },
        );
        h.adapter.script("device-0", [ScriptedAttempt::Hang]);

        let job_id = h.manager.start(scrape(1)).await.unwrap().job.id;
        let mut deferred = None;
        for _ in 0..100 {
            let snapshot = h.manager.get(job_id).unwrap();
            if let Some(timeout) = snapshot.stats.timeout.clone() {
                deferred = Some((snapshot, timeout));
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (snapshot, timeout) = deferred.expect("task was never rescheduled");
        assert_eq!(snapshot.stats.pending, 1);
        assert_eq!(timeout.next_retry_external_id.as_deref(), Some("device-0"));
        assert_eq!(snapshot.job.status, JobStatus::Running);

        let done = wait_for(&h.manager, job_id, JobStatus::Done).await;
        assert_eq!(done.stats.done, 1);
        assert_eq!(h.adapter.calls("device-0"), 2);
    }

    #[tokio::test]
    async fn empty_target_sets_finish_immediately() {
        let h = harness(ScriptedAdapter::new("gsmarena"), 0);
        let snapshot = h.manager.start(scrape(2)).await.unwrap();
        assert_eq!(snapshot.job.status, JobStatus::Done);
        assert_eq!(snapshot.stats.total, 0);
        assert!(matches!(
            h.manager.subscribe(snapshot.job.id).unwrap(),
            JobSubscription::Finished(_)
        ));
    }

    #[tokio::test]
    async fn unresolvable_filters_fail_the_job() {
        let h = harness_with(
            ScriptedAdapter::new("gsmarena"),
            Arc::new(StoreTargetResolver::new(Arc::new(InMemoryDeviceStore::new()))),
            fast_executor(),
            fast_config(),
        );
        let err = h
            .manager
            .start(NewJob::new(JobType::Scrape).with_filter("newest"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Resolve(_)));

        let jobs = h.manager.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.status, JobStatus::Error);
        assert!(jobs[0].job.completed_at.is_some());
        assert!(jobs[0].job.error_message.as_deref().unwrap().contains("newest"));
    }

    #[tokio::test]
    async fn failed_starts_close_their_event_streams() {
        let bus = Arc::new(InMemoryEventBus::new());
        let ctx = RunnerContext::new(
            TaskExecutor::new(fast_executor()),
            SourceRegistry::new().register(Arc::new(ScriptedAdapter::new("gsmarena"))),
            Arc::new(InMemoryDeviceStore::new()),
            Arc::new(PassthroughNormalizer),
        );
        let manager = BulkJobManager::new(
            InMemoryJobStore::arc(),
            bus.clone(),
            Arc::new(StoreTargetResolver::new(Arc::new(InMemoryDeviceStore::new()))),
            RunnerRegistry::standard(ctx),
            fast_config(),
        );

        for _ in 0..10 {
            let err = manager
                .start(NewJob::new(JobType::Scrape).with_filter("bogus"))
                .await
                .unwrap_err();
            assert!(matches!(err, ManagerError::Resolve(_)));
        }

        assert_eq!(bus.stream_count(), 0);
        assert_eq!(manager.list().unwrap().len(), 10);
    }

    /// Resolver that holds every resolution until a permit is released.
    struct GatedResolver {
        gate: Arc<Semaphore>,
        slugs: Vec<String>,
    }

    #[async_trait::async_trait]
    impl TargetResolver for GatedResolver {
        async fn resolve(&self, job: &Job) -> Result<Vec<Target>, ResolveError> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(self
                .slugs
                .iter()
                .map(|slug| Target {
                    external_id: slug.clone(),
                    source: job.source.clone(),
                    data_kind: job.data_kind,
                })
                .collect())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pending_jobs_accept_subscribers_while_targets_resolve() {
        let gate = Arc::new(Semaphore::new(0));
        let resolver = GatedResolver {
            gate: gate.clone(),
            slugs: slugs(2),
        };
        let h = harness_with(
            ScriptedAdapter::new("gsmarena"),
            Arc::new(resolver),
            fast_executor(),
            fast_config(),
        );

        let starting = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.start(scrape(1)).await })
        };
        let mut pending = None;
        for _ in 0..200 {
            if let Some(snapshot) = h.manager.list().unwrap().into_iter().next() {
                pending = Some(snapshot);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let pending = pending.expect("job was never stored");
        assert_eq!(pending.job.status, JobStatus::Pending);

        let subscription = h.manager.subscribe(pending.job.id).unwrap();
        let mut events = match subscription {
            JobSubscription::Live { snapshot, events } => {
                assert_eq!(snapshot.job.status, JobStatus::Pending);
                events
            }
            JobSubscription::Finished(s) => panic!("pending job reported finished: {:?}", s.job.status),
        };
        assert!(matches!(
            h.manager.pause(pending.job.id).await,
            Err(ManagerError::Domain(DomainError::InvalidTransition { .. }))
        ));

        gate.add_permits(1);
        starting.await.unwrap().unwrap();

        let seen = collect_until_done(&mut events).await;
        assert!(matches!(
            seen.last().map(|e| e.event()),
            Some(EventPayload::BulkDone { status: JobStatus::Done, .. })
        ));
    }

    #[tokio::test]
    async fn lifecycle_calls_on_unknown_jobs_are_not_found() {
        let h = harness(ScriptedAdapter::new("gsmarena"), 1);
        let missing = JobId::new();
        assert!(matches!(h.manager.pause(missing).await, Err(ManagerError::NotFound(_))));
        assert!(matches!(h.manager.get(missing), Err(ManagerError::NotFound(_))));
        assert!(matches!(h.manager.subscribe(missing), Err(ManagerError::NotFound(_))));
    }
}
