//! Consumers for scrape results.
//!
//! `results.raw` receives one message per scraped device. The raw handler only
//! validates it and hands it back as output, so the pipeline can forward records
//! that asked for AI normalisation to `results.normalize`. The normalise handler
//! turns those into processed `PhoneData` in the device store.
//!
//! Handlers must be idempotent: deliveries are at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use specscout_core::RawPhoneData;

use crate::devices::{DeviceStore, Normalizer};
use crate::transport::{HandlerError, MessageHandler, MessageTransport, NORMALIZE_QUEUE, RAW_RESULTS_QUEUE, TransportError};

/// Wire shape of a `results.raw` / `results.normalize` message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResultMessage {
    slug: String,
    raw: RawPhoneData,
    #[serde(default)]
    ai_mode: Option<String>,
}

impl RawResultMessage {
    fn parse(payload: &JsonValue) -> Result<Self, HandlerError> {
        serde_json::from_value(payload.clone()).map_err(|e| {
            HandlerError::new(format!("malformed raw result: {e}"))
                .with_details(json!({ "slug": payload.get("slug").cloned().unwrap_or(JsonValue::Null) }))
        })
    }
}

/// Validates raw results and passes them on to the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawResultHandler;

#[async_trait]
impl MessageHandler for RawResultHandler {
    async fn handle(&self, payload: &JsonValue) -> Result<Option<JsonValue>, HandlerError> {
        let message = RawResultMessage::parse(payload)?;
        debug!(slug = %message.slug, source = %message.raw.source, ai = message.ai_mode.is_some(), "raw result received");
        Ok(Some(payload.clone()))
    }
}

/// Normalises raw records and stores the processed result.
pub struct NormalizeHandler {
    normalizer: Arc<dyn Normalizer>,
    devices: Arc<dyn DeviceStore>,
}

impl NormalizeHandler {
    pub fn new(normalizer: Arc<dyn Normalizer>, devices: Arc<dyn DeviceStore>) -> Self {
        Self { normalizer, devices }
    }
}

#[async_trait]
impl MessageHandler for NormalizeHandler {
    async fn handle(&self, payload: &JsonValue) -> Result<Option<JsonValue>, HandlerError> {
        let message = RawResultMessage::parse(payload)?;
        let details = || json!({ "slug": message.slug });

        let data = self
            .normalizer
            .normalize(&message.raw, message.ai_mode.as_deref())
            .await
            .map_err(|e| HandlerError::new(format!("normalisation failed: {e}")).with_details(details()))?;
        self.devices
            .save_processed(data)
            .await
            .map_err(|e| HandlerError::new(format!("saving processed data failed: {e}")).with_details(details()))?;

        debug!(slug = %message.slug, "processed data stored");
        Ok(None)
    }
}

/// Declare the result queues and start their consumers.
///
/// Declaration failures are returned as-is; callers treat them as fatal.
pub async fn start_result_consumers(
    transport: &Arc<MessageTransport>,
    normalizer: Arc<dyn Normalizer>,
    devices: Arc<dyn DeviceStore>,
) -> Result<(), TransportError> {
    transport.declare_queue(RAW_RESULTS_QUEUE).await?;
    transport.declare_queue(NORMALIZE_QUEUE).await?;

    transport.consume(RAW_RESULTS_QUEUE, Arc::new(RawResultHandler))?;
    transport.consume(NORMALIZE_QUEUE, Arc::new(NormalizeHandler::new(normalizer, devices)))?;
    info!(raw = RAW_RESULTS_QUEUE, normalize = NORMALIZE_QUEUE, "result consumers started");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::devices::{InMemoryDeviceStore, PassthroughNormalizer};
    use crate::transport::{Pipeline, TransportConfig};

    async fn setup() -> (Arc<MessageTransport>, Arc<InMemoryDeviceStore>) {
        let transport = Arc::new(
            MessageTransport::in_memory(
                TransportConfig::default()
                    .with_message_retries(2)
                    .with_poll_interval(Duration::from_millis(10)),
            )
            .with_pipeline(Pipeline::with_default_stages()),
        );
        transport.connect().await.unwrap();
        let devices = Arc::new(InMemoryDeviceStore::new());
        start_result_consumers(&transport, Arc::new(PassthroughNormalizer), devices.clone())
            .await
            .unwrap();
        (transport, devices)
    }

    fn raw_result(slug: &str, ai_mode: Option<&str>) -> JsonValue {
        json!({
            "slug": slug,
            "source": "gsmarena",
            "raw": RawPhoneData {
                slug: slug.to_string(),
                source: "gsmarena".to_string(),
                name: Some("Pixel 9".to_string()),
                specs: json!({ "brand": "Google" }),
                fetched_at: Utc::now(),
            },
            "aiMode": ai_mode,
        })
    }

    #[tokio::test]
    async fn ai_results_flow_through_to_processed_data() {
        let (transport, devices) = setup().await;
        transport
            .publish(RAW_RESULTS_QUEUE, raw_result("pixel-9", Some("fast")))
            .await
            .unwrap();

        for _ in 0..200 {
            if devices.device("pixel-9").is_some_and(|d| d.processed.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let processed = devices.device("pixel-9").and_then(|d| d.processed).unwrap();
        assert_eq!(processed.brand.as_deref(), Some("Google"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn results_without_ai_mode_stop_at_the_raw_queue() {
        let (transport, devices) = setup().await;
        transport
            .publish(RAW_RESULTS_QUEUE, raw_result("pixel-9", None))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.queue_len(RAW_RESULTS_QUEUE).await.unwrap(), 0);
        assert!(devices.device("pixel-9").is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_results_are_dead_lettered() {
        let (transport, _devices) = setup().await;
        transport
            .publish(RAW_RESULTS_QUEUE, json!({ "slug": "broken" }))
            .await
            .unwrap();

        for _ in 0..200 {
            if !transport.dead_letters(RAW_RESULTS_QUEUE).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let dead = transport.dead_letters(RAW_RESULTS_QUEUE).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retries, 2);
        transport.close().await.unwrap();
    }
}
