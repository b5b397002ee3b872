use std::sync::Arc;

use anyhow::Context;

use specscout_infra::config::AppConfig;
use specscout_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    specscout_observability::tracing::init(&LogConfig::new(&config.log_format, config.log_level.clone()));

    let services = Arc::new(
        specscout_api::app::services::build_services(&config)
            .await
            .context("starting services")?,
    );
    let app = specscout_api::app::build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server failed")?;

    services.shutdown().await
}
