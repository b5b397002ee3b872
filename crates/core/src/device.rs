//! Device data records exchanged with source adapters and persistence.
//!
//! The core treats vendor specifications as opaque JSON: the heuristics that
//! produce `RawPhoneData` and the normalisation that turns it into `PhoneData`
//! live behind collaborator traits in the infrastructure layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Stage of a device record in the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Vendor page HTML as fetched.
    Html,
    /// Specifications extracted from the HTML, still vendor-shaped.
    Raw,
    /// Normalised specifications.
    Processed,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Html => "html",
            DataKind::Raw => "raw",
            DataKind::Processed => "processed",
        }
    }
}

impl core::fmt::Display for DataKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-shaped specification record produced by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPhoneData {
    pub slug: String,
    pub source: String,
    pub name: Option<String>,
    /// Extracted specification fields, keyed by the vendor's own labels.
    pub specs: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

/// Normalised specification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneData {
    pub slug: String,
    pub name: String,
    pub brand: Option<String>,
    pub data: JsonValue,
}

/// One hit returned by a source search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub slug: String,
    pub name: String,
    pub url: Option<String>,
}

/// What a source adapter yields for one scraped device page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedDevice {
    pub slug: String,
    /// Page HTML when the adapter keeps it, for later re-extraction.
    pub html: Option<String>,
    pub raw: RawPhoneData,
}

/// Final data of a `scrape` call: the raw record plus its normalised form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub slug: String,
    pub data: PhoneData,
    pub raw: RawPhoneData,
}
