//! `specscout-core`: domain foundation for bulk device-data jobs.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the bulk `Job` state machine, per-target `Task`s, derived `JobStats`, and the
//! device data records that flow between source adapters and persistence.

pub mod device;
pub mod entity;
pub mod error;
pub mod id;
pub mod job;
pub mod stats;
pub mod task;

pub use device::{DataKind, PhoneData, RawPhoneData, ScrapeResult, ScrapedDevice, SearchResult};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, TaskId};
pub use job::{Job, JobMode, JobStatus, JobType, NewJob};
pub use stats::{JobStats, TimeoutStats};
pub use task::{Task, TaskStatus};
