//! Scheduled synchronization engine.
//!
//! A [`SyncDefinition`](types::SyncDefinition) describes one external
//! endpoint, an extraction path into its response, a transform script and a
//! recurrence. The [`SyncScheduler`](scheduler::SyncScheduler) dispatches due
//! definitions into a bounded pool; [`SyncService`](service::SyncService)
//! owns the run flow (lease, fetch, extract, transform, record) and the
//! admin/read operations.

pub mod extract;
pub mod fetch;
pub mod pipeline;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transform;
pub mod types;

pub use fetch::{Fetcher, HttpFetcher};
pub use schedule::{CronCrateEvaluator, CronEvaluator, ScheduleCalculator};
pub use scheduler::{SchedulerMetrics, SchedulerSnapshot, SyncScheduler};
pub use service::{EngineSettings, SyncError, SyncService};
pub use store::{MemoryStore, PgSyncStore, StoreError, SyncStore};
pub use transform::Transformer;
pub use types::*;
