//! Per-job-type task runners.
//!
//! A runner performs the work of one task and reports an outcome; it never
//! touches task or job state, the manager applies outcomes. Every external call
//! goes through the [`TaskExecutor`], so timeouts and retries behave the same
//! for adapter calls and collaborator calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use specscout_core::{DataKind, Job, JobType, ScrapedDevice, Task};
use specscout_events::{EventPayload, LogLevel};

use super::executor::{ExecutionOutcome, TaskExecutor};
use crate::devices::{CollaboratorError, DeviceStore, Extractor, Normalizer};
use crate::emit::EventSink;
use crate::source::{AdapterItem, AdapterStream, SourceAdapter, SourceRegistry};
use crate::transport::{MessageTransport, RAW_RESULTS_QUEUE};

/// Result of running one task, applied by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done { retries: u32 },
    Failed { error: String, retries: u32, timed_out: bool },
}

impl TaskOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retries: 0,
            timed_out: false,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    fn with_retries(self, spent: u32) -> Self {
        match self {
            Self::Done { retries } => Self::Done { retries: retries + spent },
            Self::Failed {
                error,
                retries,
                timed_out,
            } => Self::Failed {
                error,
                retries: retries + spent,
                timed_out,
            },
        }
    }
}

/// Runs one task of a job.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, job: &Job, task: &Task, sink: &dyn EventSink) -> TaskOutcome;
}

/// Collaborators shared by the standard runners.
#[derive(Clone)]
pub struct RunnerContext {
    pub executor: TaskExecutor,
    pub sources: SourceRegistry,
    pub devices: Arc<dyn DeviceStore>,
    pub normalizer: Arc<dyn Normalizer>,
    pub extractor: Option<Arc<dyn Extractor>>,
    /// Where scrape results are published for downstream stages.
    pub transport: Option<Arc<MessageTransport>>,
}

impl RunnerContext {
    pub fn new(
        executor: TaskExecutor,
        sources: SourceRegistry,
        devices: Arc<dyn DeviceStore>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Self {
        Self {
            executor,
            sources,
            devices,
            normalizer,
            extractor: None,
            transport: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_transport(mut self, transport: Arc<MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn adapter(&self, source: Option<&str>) -> Result<Arc<dyn SourceAdapter>, TaskOutcome> {
        self.sources
            .get(source)
            .ok_or_else(|| TaskOutcome::failed(format!("unknown source: {}", source.unwrap_or("<default>"))))
    }

    /// Run a collaborator call under the executor's timeout and retry policy.
    async fn collaborate<T, F, Fut>(&self, sink: &dyn EventSink, mut call: F) -> ExecutionOutcome<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
    {
        self.executor
            .execute(|| single(call()), sink, &CancellationToken::new())
            .await
    }
}

fn single<T, Fut>(fut: Fut) -> AdapterStream<T, CollaboratorError>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
{
    stream::once(fut).map(|r| r.map(AdapterItem::Data)).boxed()
}

/// Split an execution outcome into its data, or the task outcome to report.
fn settle<T>(outcome: ExecutionOutcome<T>) -> Result<(Option<T>, u32), TaskOutcome> {
    match outcome {
        ExecutionOutcome::Done { data, retries } => Ok((data, retries)),
        ExecutionOutcome::Failed {
            error,
            retries,
            timed_out,
        } => Err(TaskOutcome::Failed {
            error,
            retries,
            timed_out,
        }),
        ExecutionOutcome::Cancelled { retries } => Err(TaskOutcome::Failed {
            error: "cancelled".to_string(),
            retries,
            timed_out: false,
        }),
    }
}

/// Report a stage failure after `retries` were already spent.
fn store_failure(err: CollaboratorError, retries: u32) -> TaskOutcome {
    TaskOutcome::failed(err.message).with_retries(retries)
}

/// `scrape`: fetch the device page through its source adapter.
pub struct ScrapeRunner {
    ctx: RunnerContext,
}

impl ScrapeRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }

    async fn persist(&self, device: &ScrapedDevice) -> Result<(), CollaboratorError> {
        if let Some(html) = &device.html {
            self.ctx.devices.save_html(&device.slug, html.clone()).await?;
        }
        self.ctx.devices.save_raw(device.raw.clone()).await
    }

    async fn publish_raw(&self, job: &Job, device: &ScrapedDevice, sink: &dyn EventSink) {
        let Some(transport) = &self.ctx.transport else {
            return;
        };
        let payload = json!({
            "jobId": job.id,
            "slug": device.slug,
            "source": device.raw.source,
            "raw": device.raw,
            "aiMode": job.ai_mode,
            "mode": job.mode,
        });
        if let Err(e) = transport.publish(RAW_RESULTS_QUEUE, payload).await {
            warn!(job_id = %job.id, slug = %device.slug, error = %e, "failed to publish raw result");
            sink.emit(EventPayload::log(
                LogLevel::Warn,
                format!("raw result not queued for {}: {e}", device.slug),
            ));
        }
    }
}

#[async_trait]
impl TaskRunner for ScrapeRunner {
    async fn run(&self, job: &Job, task: &Task, sink: &dyn EventSink) -> TaskOutcome {
        let adapter = match self.ctx.adapter(task.source.as_deref()) {
            Ok(adapter) => adapter,
            Err(outcome) => return outcome,
        };
        let slug = task.external_id.as_str();

        let outcome = self
            .ctx
            .executor
            .execute(|| adapter.scrape(slug), sink, &CancellationToken::new())
            .await;
        let (device, retries) = match settle(outcome) {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };

        let Some(device) = device else {
            debug!(job_id = %job.id, slug, "source returned no data");
            return TaskOutcome::Done { retries };
        };
        if let Err(e) = self.persist(&device).await {
            return store_failure(e, retries);
        }
        self.publish_raw(job, &device, sink).await;
        TaskOutcome::Done { retries }
    }
}

/// `process_raw`: extract raw specs from stored HTML.
pub struct ProcessRawRunner {
    ctx: RunnerContext,
}

impl ProcessRawRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskRunner for ProcessRawRunner {
    async fn run(&self, _job: &Job, task: &Task, sink: &dyn EventSink) -> TaskOutcome {
        let Some(extractor) = self.ctx.extractor.clone() else {
            return TaskOutcome::failed("no extractor configured");
        };
        let slug = task.external_id.clone();
        let html = match self.ctx.devices.html(&slug).await {
            Ok(Some(html)) => html,
            Ok(None) => return TaskOutcome::failed(format!("no html stored for {slug}")),
            Err(e) => return store_failure(e, 0),
        };
        let source = match self.ctx.adapter(task.source.as_deref()) {
            Ok(adapter) => adapter.name().to_string(),
            Err(_) => task.source.clone().unwrap_or_default(),
        };

        let outcome = self
            .ctx
            .collaborate(sink, || {
                let (extractor, slug, source, html) = (extractor.clone(), slug.clone(), source.clone(), html.clone());
                async move { extractor.extract(&slug, &source, &html).await }
            })
            .await;
        let (raw, retries) = match settle(outcome) {
            Ok((Some(raw), retries)) => (raw, retries),
            Ok((None, retries)) => return TaskOutcome::Done { retries },
            Err(outcome) => return outcome,
        };

        match self.ctx.devices.save_raw(raw).await {
            Ok(()) => TaskOutcome::Done { retries },
            Err(e) => store_failure(e, retries),
        }
    }
}

/// `process_ai`: normalise stored raw specs.
pub struct ProcessAiRunner {
    ctx: RunnerContext,
}

impl ProcessAiRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskRunner for ProcessAiRunner {
    async fn run(&self, job: &Job, task: &Task, sink: &dyn EventSink) -> TaskOutcome {
        let raw = match self.ctx.devices.raw(&task.external_id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return TaskOutcome::failed(format!("no raw data stored for {}", task.external_id)),
            Err(e) => return store_failure(e, 0),
        };
        let normalizer = Arc::clone(&self.ctx.normalizer);
        let ai_mode = job.ai_mode.clone();

        let outcome = self
            .ctx
            .collaborate(sink, || {
                let (normalizer, raw, ai_mode) = (normalizer.clone(), raw.clone(), ai_mode.clone());
                async move { normalizer.normalize(&raw, ai_mode.as_deref()).await }
            })
            .await;
        let (data, retries) = match settle(outcome) {
            Ok((Some(data), retries)) => (data, retries),
            Ok((None, retries)) => return TaskOutcome::Done { retries },
            Err(outcome) => return outcome,
        };

        match self.ctx.devices.save_processed(data).await {
            Ok(()) => TaskOutcome::Done { retries },
            Err(e) => store_failure(e, retries),
        }
    }
}

/// `clear_html` / `clear_raw` / `clear_processed`.
pub struct ClearRunner {
    ctx: RunnerContext,
    kind: DataKind,
}

impl ClearRunner {
    pub fn new(ctx: RunnerContext, kind: DataKind) -> Self {
        Self { ctx, kind }
    }
}

#[async_trait]
impl TaskRunner for ClearRunner {
    async fn run(&self, job: &Job, task: &Task, sink: &dyn EventSink) -> TaskOutcome {
        let kind = task.data_kind.or(job.data_kind).unwrap_or(self.kind);
        let devices = Arc::clone(&self.ctx.devices);
        let slug = task.external_id.clone();

        let outcome = self
            .ctx
            .collaborate(sink, || {
                let (devices, slug) = (devices.clone(), slug.clone());
                async move { devices.clear(&slug, kind).await }
            })
            .await;
        match settle(outcome) {
            Ok((cleared, retries)) => {
                let message = if cleared.unwrap_or(false) {
                    format!("cleared {kind} of {slug}")
                } else {
                    format!("no {kind} stored for {slug}")
                };
                sink.emit(EventPayload::log(LogLevel::Info, message));
                TaskOutcome::Done { retries }
            }
            Err(outcome) => outcome,
        }
    }
}

/// `link_source`: find the device at the job's source and record the link.
pub struct LinkSourceRunner {
    ctx: RunnerContext,
}

impl LinkSourceRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskRunner for LinkSourceRunner {
    async fn run(&self, job: &Job, task: &Task, sink: &dyn EventSink) -> TaskOutcome {
        let source = task.source.as_deref().or(job.source.as_deref());
        let adapter = match self.ctx.adapter(source) {
            Ok(adapter) => adapter,
            Err(outcome) => return outcome,
        };
        let slug = task.external_id.as_str();
        let query = slug.replace('-', " ");

        let outcome = self
            .ctx
            .executor
            .execute(|| adapter.search(&query), sink, &CancellationToken::new())
            .await;
        let (results, retries) = match settle(outcome) {
            Ok((results, retries)) => (results.unwrap_or_default(), retries),
            Err(outcome) => return outcome,
        };

        let best = results
            .iter()
            .find(|r| r.slug == slug)
            .or_else(|| results.first());
        let Some(best) = best else {
            return TaskOutcome::failed(format!("no match for {slug} at {}", adapter.name())).with_retries(retries);
        };

        match self.ctx.devices.link_source(slug, adapter.name(), &best.slug).await {
            Ok(()) => {
                sink.emit(EventPayload::log(
                    LogLevel::Info,
                    format!("linked {slug} to {}:{}", adapter.name(), best.slug),
                ));
                TaskOutcome::Done { retries }
            }
            Err(e) => store_failure(e, retries),
        }
    }
}

/// Runner per job type.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<JobType, Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard runner for every job type.
    pub fn standard(ctx: RunnerContext) -> Self {
        Self::new()
            .with_runner(JobType::Scrape, Arc::new(ScrapeRunner::new(ctx.clone())))
            .with_runner(JobType::ProcessRaw, Arc::new(ProcessRawRunner::new(ctx.clone())))
            .with_runner(JobType::ProcessAi, Arc::new(ProcessAiRunner::new(ctx.clone())))
            .with_runner(JobType::ClearHtml, Arc::new(ClearRunner::new(ctx.clone(), DataKind::Html)))
            .with_runner(JobType::ClearRaw, Arc::new(ClearRunner::new(ctx.clone(), DataKind::Raw)))
            .with_runner(
                JobType::ClearProcessed,
                Arc::new(ClearRunner::new(ctx.clone(), DataKind::Processed)),
            )
            .with_runner(JobType::LinkSource, Arc::new(LinkSourceRunner::new(ctx)))
    }

    pub fn with_runner(mut self, job_type: JobType, runner: Arc<dyn TaskRunner>) -> Self {
        self.runners.insert(job_type, runner);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(&job_type).cloned()
    }
}
