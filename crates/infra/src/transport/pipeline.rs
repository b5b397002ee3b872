//! Pipeline stages chained by queue name.
//!
//! A successfully handled message may produce an output value. Every stage whose
//! `source_queue` matches the queue the message came from transforms that output
//! and, if the transform yields a value, publishes it to `destination_queue`.
//!
//! The chain is plain data: stages can be listed, inspected and tested without a
//! running transport.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

/// Raw device records produced by scrape tasks.
pub const RAW_RESULTS_QUEUE: &str = "results.raw";

/// Raw records waiting for AI normalisation.
pub const NORMALIZE_QUEUE: &str = "results.normalize";

type Transform = Arc<dyn Fn(&JsonValue) -> Option<JsonValue> + Send + Sync>;

/// One `(source_queue, transform, destination_queue)` stage.
#[derive(Clone)]
pub struct PipelineStage {
    pub source_queue: String,
    pub destination_queue: String,
    transform: Transform,
}

impl PipelineStage {
    pub fn new<F>(source_queue: impl Into<String>, destination_queue: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<JsonValue> + Send + Sync + 'static,
    {
        Self {
            source_queue: source_queue.into(),
            destination_queue: destination_queue.into(),
            transform: Arc::new(transform),
        }
    }

    /// Stage forwarding the output unchanged.
    pub fn forward(source_queue: impl Into<String>, destination_queue: impl Into<String>) -> Self {
        Self::new(source_queue, destination_queue, |value| Some(value.clone()))
    }

    pub fn apply(&self, output: &JsonValue) -> Option<JsonValue> {
        (self.transform)(output)
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("source_queue", &self.source_queue)
            .field("destination_queue", &self.destination_queue)
            .finish_non_exhaustive()
    }
}

/// Ordered registry of pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default wiring: raw scrape results that asked for AI normalisation move
    /// on to the normalisation queue.
    pub fn with_default_stages() -> Self {
        Self::new().stage(PipelineStage::new(RAW_RESULTS_QUEUE, NORMALIZE_QUEUE, |output| {
            let wants_ai = output.get("aiMode").is_some_and(|mode| !mode.is_null());
            wants_ai.then(|| output.clone())
        }))
    }

    pub fn stage(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Destination queues every stage of the chain publishes to.
    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.destination_queue.as_str())
    }

    /// Derived messages for an output of `source_queue`, in stage order.
    pub fn route(&self, source_queue: &str, output: &JsonValue) -> Vec<(String, JsonValue)> {
        self.stages
            .iter()
            .filter(|stage| stage.source_queue == source_queue)
            .filter_map(|stage| stage.apply(output).map(|v| (stage.destination_queue.clone(), v)))
            .collect()
    }
}
