//! Device data collaborators: persistence, extraction and normalisation.
//!
//! The bulk machinery only needs a narrow view of device storage: which slugs
//! match a filter, read/write of the three data stages, and source links. The
//! real relational store lives outside this crate; `InMemoryDeviceStore` is the
//! dev/test implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use specscout_core::{DataKind, PhoneData, RawPhoneData};

use crate::source::AdapterFailure;

/// Failure reported by a collaborator (store, extractor, normaliser).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub retryable: bool,
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl AdapterFailure for CollaboratorError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Named selector over stored devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFilter {
    All,
    /// Neither HTML nor raw data yet.
    Unscraped,
    /// HTML stored, raw data not extracted.
    UnprocessedRaw,
    /// Raw data stored, not normalised.
    UnprocessedAi,
    HasHtml,
    HasRaw,
    HasProcessed,
    /// Not linked to the requested source.
    Unlinked,
}

impl DeviceFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFilter::All => "all",
            DeviceFilter::Unscraped => "unscraped",
            DeviceFilter::UnprocessedRaw => "unprocessed_raw",
            DeviceFilter::UnprocessedAi => "unprocessed_ai",
            DeviceFilter::HasHtml => "has_html",
            DeviceFilter::HasRaw => "has_raw",
            DeviceFilter::HasProcessed => "has_processed",
            DeviceFilter::Unlinked => "unlinked",
        }
    }
}

impl core::fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown filter: {0}")]
pub struct UnknownFilter(pub String);

impl FromStr for DeviceFilter {
    type Err = UnknownFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(DeviceFilter::All),
            "unscraped" => Ok(DeviceFilter::Unscraped),
            "unprocessed_raw" => Ok(DeviceFilter::UnprocessedRaw),
            "unprocessed_ai" => Ok(DeviceFilter::UnprocessedAi),
            "has_html" => Ok(DeviceFilter::HasHtml),
            "has_raw" => Ok(DeviceFilter::HasRaw),
            "has_processed" => Ok(DeviceFilter::HasProcessed),
            "unlinked" => Ok(DeviceFilter::Unlinked),
            other => Err(UnknownFilter(other.to_string())),
        }
    }
}

/// Device persistence as seen by bulk jobs.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Slugs matching `filter`, sorted. `source` only matters for `Unlinked`.
    async fn list_slugs(&self, filter: DeviceFilter, source: Option<&str>) -> Result<Vec<String>, CollaboratorError>;

    async fn html(&self, slug: &str) -> Result<Option<String>, CollaboratorError>;

    async fn raw(&self, slug: &str) -> Result<Option<RawPhoneData>, CollaboratorError>;

    async fn save_html(&self, slug: &str, html: String) -> Result<(), CollaboratorError>;

    async fn save_raw(&self, raw: RawPhoneData) -> Result<(), CollaboratorError>;

    async fn save_processed(&self, data: PhoneData) -> Result<(), CollaboratorError>;

    /// Remove one data stage. Returns whether anything was removed.
    async fn clear(&self, slug: &str, kind: DataKind) -> Result<bool, CollaboratorError>;

    /// Record that `slug` is known to `source` as `external_slug`.
    async fn link_source(&self, slug: &str, source: &str, external_slug: &str) -> Result<(), CollaboratorError>;

    async fn is_linked(&self, slug: &str, source: &str) -> Result<bool, CollaboratorError>;
}

/// Turns extracted raw data into normalised phone data.
#[async_trait]
pub trait Normalizer: Send + Sync {
    async fn normalize(&self, raw: &RawPhoneData, ai_mode: Option<&str>) -> Result<PhoneData, CollaboratorError>;
}

/// Extracts raw specifications from a stored vendor page.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, slug: &str, source: &str, html: &str) -> Result<RawPhoneData, CollaboratorError>;
}

/// Normaliser that keeps vendor specs as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughNormalizer;

#[async_trait]
impl Normalizer for PassthroughNormalizer {
    async fn normalize(&self, raw: &RawPhoneData, _ai_mode: Option<&str>) -> Result<PhoneData, CollaboratorError> {
        Ok(PhoneData {
            slug: raw.slug.clone(),
            name: raw.name.clone().unwrap_or_else(|| raw.slug.clone()),
            brand: raw.specs.get("brand").and_then(|b| b.as_str()).map(str::to_string),
            data: raw.specs.clone(),
        })
    }
}

/// Stored state of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecord {
    pub html: Option<String>,
    pub raw: Option<RawPhoneData>,
    pub processed: Option<PhoneData>,
    /// source name → slug at that source.
    pub links: BTreeMap<String, String>,
}

impl DeviceRecord {
    fn matches(&self, filter: DeviceFilter, source: Option<&str>) -> bool {
        match filter {
            DeviceFilter::All => true,
            DeviceFilter::Unscraped => self.html.is_none() && self.raw.is_none(),
            DeviceFilter::UnprocessedRaw => self.html.is_some() && self.raw.is_none(),
            DeviceFilter::UnprocessedAi => self.raw.is_some() && self.processed.is_none(),
            DeviceFilter::HasHtml => self.html.is_some(),
            DeviceFilter::HasRaw => self.raw.is_some(),
            DeviceFilter::HasProcessed => self.processed.is_some(),
            DeviceFilter::Unlinked => source.is_none_or(|s| !self.links.contains_key(s)),
        }
    }
}

/// In-memory device store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeviceStore {
    devices: RwLock<BTreeMap<String, DeviceRecord>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed devices with no data.
    pub fn with_devices<I, S>(self, slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for slug in slugs {
            self.insert_device(slug, DeviceRecord::default());
        }
        self
    }

    pub fn insert_device(&self, slug: impl Into<String>, record: DeviceRecord) {
        if let Ok(mut devices) = self.devices.write() {
            devices.insert(slug.into(), record);
        }
    }

    pub fn device(&self, slug: &str) -> Option<DeviceRecord> {
        self.devices.read().ok()?.get(slug).cloned()
    }

    fn update<R>(&self, slug: &str, f: impl FnOnce(&mut DeviceRecord) -> R) -> Result<R, CollaboratorError> {
        let mut devices = self
            .devices
            .write()
            .map_err(|_| CollaboratorError::terminal("device store lock poisoned"))?;
        Ok(f(devices.entry(slug.to_string()).or_default()))
    }

    fn read<R>(&self, slug: &str, f: impl FnOnce(&DeviceRecord) -> R) -> Result<Option<R>, CollaboratorError> {
        let devices = self
            .devices
            .read()
            .map_err(|_| CollaboratorError::terminal("device store lock poisoned"))?;
        Ok(devices.get(slug).map(f))
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn list_slugs(&self, filter: DeviceFilter, source: Option<&str>) -> Result<Vec<String>, CollaboratorError> {
        let devices = self
            .devices
            .read()
            .map_err(|_| CollaboratorError::terminal("device store lock poisoned"))?;
        Ok(devices
            .iter()
            .filter(|(_, record)| record.matches(filter, source))
            .map(|(slug, _)| slug.clone())
            .collect())
    }

    async fn html(&self, slug: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self.read(slug, |r| r.html.clone())?.flatten())
    }

    async fn raw(&self, slug: &str) -> Result<Option<RawPhoneData>, CollaboratorError> {
        Ok(self.read(slug, |r| r.raw.clone())?.flatten())
    }

    async fn save_html(&self, slug: &str, html: String) -> Result<(), CollaboratorError> {
        self.update(slug, |r| r.html = Some(html))
    }

    async fn save_raw(&self, raw: RawPhoneData) -> Result<(), CollaboratorError> {
        let slug = raw.slug.clone();
        self.update(&slug, |r| r.raw = Some(raw))
    }

    async fn save_processed(&self, data: PhoneData) -> Result<(), CollaboratorError> {
        let slug = data.slug.clone();
        self.update(&slug, |r| r.processed = Some(data))
    }

    async fn clear(&self, slug: &str, kind: DataKind) -> Result<bool, CollaboratorError> {
        let cleared = self.read(slug, |_| ())?.is_some()
            && self.update(slug, |r| match kind {
                DataKind::Html => r.html.take().is_some(),
                DataKind::Raw => r.raw.take().is_some(),
                DataKind::Processed => r.processed.take().is_some(),
            })?;
        Ok(cleared)
    }

    async fn link_source(&self, slug: &str, source: &str, external_slug: &str) -> Result<(), CollaboratorError> {
        self.update(slug, |r| {
            r.links.insert(source.to_string(), external_slug.to_string());
        })
    }

    async fn is_linked(&self, slug: &str, source: &str) -> Result<bool, CollaboratorError> {
        Ok(self.read(slug, |r| r.links.contains_key(source))?.unwrap_or(false))
    }
}

/// Distinct slugs, keeping first-seen order.
pub(crate) fn dedup_slugs<I>(slugs: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = BTreeSet::new();
    slugs
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
