//! Service wiring: transport, sources, collaborators, bulk jobs and the facade.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use specscout_events::{EventBus, InMemoryEventBus};
use specscout_infra::ScrapeService;
use specscout_infra::config::{AppConfig, SourceConfig, TransportKind};
use specscout_infra::devices::{DeviceStore, InMemoryDeviceStore, Normalizer, PassthroughNormalizer};
use specscout_infra::jobs::{
    BulkJobManager, InMemoryJobStore, RunnerContext, RunnerRegistry, StoreTargetResolver, TaskExecutor,
};
use specscout_infra::source::{HttpSourceAdapter, ScriptedAdapter, SourceAdapter, SourceRegistry};
use specscout_infra::transport::{MessageTransport, Pipeline};
use specscout_infra::workers::start_result_consumers;

/// Everything the HTTP layer calls into.
#[derive(Clone)]
pub struct AppServices {
    pub scrape: ScrapeService,
    pub bulk: BulkJobManager,
    pub transport: Arc<MessageTransport>,
    pub devices: Arc<dyn DeviceStore>,
}

impl AppServices {
    /// Stop consumers and close the broker.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.transport.close().await.context("closing message transport")
    }
}

/// Build and start all services for `config`.
///
/// Transport connection and queue declaration failures are fatal.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::with_capacity(config.event_buffer));
    let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
    let normalizer: Arc<dyn Normalizer> = Arc::new(PassthroughNormalizer);

    let transport = Arc::new(build_transport(config)?.with_pipeline(Pipeline::with_default_stages()));
    transport.connect().await.context("connecting message transport")?;
    start_result_consumers(&transport, Arc::clone(&normalizer), Arc::clone(&devices))
        .await
        .context("declaring result queues")?;

    let sources = SourceRegistry::new().register(source_adapter(config));
    let executor = TaskExecutor::new(config.executor_config());

    let ctx = RunnerContext::new(
        executor.clone(),
        sources.clone(),
        Arc::clone(&devices),
        Arc::clone(&normalizer),
    )
    .with_transport(Arc::clone(&transport));

    let bulk = BulkJobManager::new(
        InMemoryJobStore::arc(),
        Arc::clone(&bus),
        Arc::new(StoreTargetResolver::new(Arc::clone(&devices))),
        RunnerRegistry::standard(ctx),
        config.manager_config(),
    );
    let scrape = ScrapeService::new(sources, executor, normalizer, bus);

    info!(transport = ?config.transport, workers = config.default_workers, "services ready");
    Ok(AppServices {
        scrape,
        bulk,
        transport,
        devices,
    })
}

fn build_transport(config: &AppConfig) -> anyhow::Result<MessageTransport> {
    match config.transport {
        TransportKind::Memory => Ok(MessageTransport::in_memory(config.transport_config())),
        #[cfg(feature = "redis")]
        TransportKind::Redis => {
            let broker = specscout_infra::transport::redis::RedisBroker::new(&config.redis_url, config.queue_prefix.clone())
                .context("creating redis broker")?;
            Ok(MessageTransport::new(Arc::new(broker), config.transport_config()))
        }
        #[cfg(not(feature = "redis"))]
        TransportKind::Redis => anyhow::bail!("TRANSPORT=redis requires the `redis` feature"),
    }
}

fn source_adapter(config: &AppConfig) -> Arc<dyn SourceAdapter> {
    match &config.source {
        SourceConfig::Http { name, url } => {
            info!(source = %name, %url, "using http source adapter");
            Arc::new(HttpSourceAdapter::new(name.clone(), url.clone()))
        }
        SourceConfig::Scripted => {
            warn!("using scripted source adapter; device data is canned");
            Arc::new(ScriptedAdapter::new("scripted"))
        }
    }
}
