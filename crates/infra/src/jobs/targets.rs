//! Resolution of a job's filter into its task targets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use specscout_core::{DataKind, Job};

use crate::devices::{CollaboratorError, DeviceFilter, DeviceStore, UnknownFilter, dedup_slugs};

/// One target of a bulk job; becomes one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub external_id: String,
    pub source: Option<String>,
    pub data_kind: Option<DataKind>,
}

impl Target {
    fn for_job(job: &Job, external_id: String) -> Self {
        Self {
            external_id,
            source: job.source.clone(),
            data_kind: job.data_kind,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    UnknownFilter(#[from] UnknownFilter),
    #[error("target lookup failed: {0}")]
    Store(#[from] CollaboratorError),
}

/// Turns a job's `filter` (or explicit `slugs`) into targets.
///
/// Explicit slugs always win over the filter.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, job: &Job) -> Result<Vec<Target>, ResolveError>;
}

/// Resolves filters against a [`DeviceStore`].
#[derive(Clone)]
pub struct StoreTargetResolver {
    store: Arc<dyn DeviceStore>,
}

impl StoreTargetResolver {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TargetResolver for StoreTargetResolver {
    async fn resolve(&self, job: &Job) -> Result<Vec<Target>, ResolveError> {
        let slugs = match &job.slugs {
            Some(slugs) => slugs.clone(),
            None => {
                let filter: DeviceFilter = job.filter.parse()?;
                self.store.list_slugs(filter, job.source.as_deref()).await?
            }
        };
        Ok(dedup_slugs(slugs)
            .into_iter()
            .map(|slug| Target::for_job(job, slug))
            .collect())
    }
}

/// Fixed filter → slugs table, for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct StaticTargetResolver {
    filters: HashMap<String, Vec<String>>,
}

impl StaticTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter<I, S>(mut self, filter: &str, slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(filter.to_string(), slugs.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl TargetResolver for StaticTargetResolver {
    async fn resolve(&self, job: &Job) -> Result<Vec<Target>, ResolveError> {
        let slugs = match &job.slugs {
            Some(slugs) => slugs.clone(),
            None => self
                .filters
                .get(&job.filter)
                .cloned()
                .ok_or_else(|| UnknownFilter(job.filter.clone()))?,
        };
        Ok(dedup_slugs(slugs)
            .into_iter()
            .map(|slug| Target::for_job(job, slug))
            .collect())
    }
}
