//! Infrastructure layer: message transport, source adapters, bulk jobs,
//! result consumers, collaborators and configuration.

pub mod config;
pub mod devices;
pub mod emit;
pub mod jobs;
pub mod service;
pub mod source;
pub mod transport;
pub mod workers;

pub use service::{CallStream, ScrapeService, ServiceError, ServiceItem};
