//! Bulk jobs: task execution, retry policy, job storage and the worker pool.
//!
//! ## Components
//!
//! - `TaskExecutor`: one adapter call under a timeout and a `RetryPolicy`
//! - `JobStore`: jobs and their tasks (in-memory for dev/tests)
//! - `TargetResolver`: filter → targets
//! - `TaskRunner`: what one task does, per job type
//! - `BulkJobManager`: job lifecycle, worker pool, `bulk.*` events

pub mod executor;
pub mod manager;
pub mod runners;
pub mod store;
pub mod targets;
pub mod types;
mod worker;

pub use executor::{ExecutionOutcome, ExecutorConfig, TaskExecutor};
pub use manager::{BulkJobManager, JobSnapshot, JobSubscription, ManagerConfig, ManagerError};
pub use runners::{
    ClearRunner, LinkSourceRunner, ProcessAiRunner, ProcessRawRunner, RunnerContext, RunnerRegistry, ScrapeRunner,
    TaskOutcome, TaskRunner,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use targets::{ResolveError, StaticTargetResolver, StoreTargetResolver, Target, TargetResolver};
pub use types::{BackoffStrategy, CompletionPolicy, RetryPolicy};
