//! Persistence for definitions, run history, result snapshots and leases.
//!
//! [`SyncStore::record_run`] is the run recorder: it appends the run record,
//! bumps counters, updates the definition's run state and (on success) the
//! result snapshot in one atomic write. Configuration edits go through
//! [`SyncStore::update_config`], which never touches run state.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Lease, RecordDisposition, ResultSnapshot, RunCompletion, RunRecord, SyncDefinition,
};

pub use self::memory::MemoryStore;
pub use self::postgres::PgSyncStore;

/// `last_error` of a definition whose run released its lease unrecorded.
pub const UNRECORDED_RUN_ERROR: &str = "run ended before it was recorded";

/// Errors from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sync definition not found: {0}")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Database(_) | Self::Corrupt(_) | Self::LockPoisoned => 500,
        }
    }
}

/// Storage backend for the engine.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn insert_definition(&self, definition: &SyncDefinition) -> Result<(), StoreError>;

    /// All definitions, optionally for one tool, oldest first.
    async fn list_definitions(&self, tool_id: Option<&str>)
        -> Result<Vec<SyncDefinition>, StoreError>;

    async fn get_definition(&self, id: Uuid) -> Result<Option<SyncDefinition>, StoreError>;

    /// Write the configuration fields of `definition`. When `reschedule` is
    /// set, `next_run_at` is written too. Returns the stored definition.
    async fn update_config(
        &self,
        definition: &SyncDefinition,
        reschedule: bool,
    ) -> Result<SyncDefinition, StoreError>;

    /// Delete a definition with its history, result and lease.
    /// Returns `false` if it did not exist.
    async fn delete_definition(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Active definitions whose `next_run_at` is unset or `<= now`.
    async fn due_definitions(&self, now: DateTime<Utc>) -> Result<Vec<SyncDefinition>, StoreError>;

    /// Take the single-flight lease if it is free or expired. Bumps the
    /// definition's `run_seq` and marks it RUNNING.
    async fn try_acquire_lease(
        &self,
        id: Uuid,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Release a lease if it is still held by the same holder and run. If
    /// that run was never recorded, the definition leaves RUNNING for FAILED
    /// with [`UNRECORDED_RUN_ERROR`]; counters are untouched.
    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Record a finished run atomically.
    async fn record_run(
        &self,
        lease: &Lease,
        completion: RunCompletion,
    ) -> Result<RecordDisposition, StoreError>;

    /// Most recent run records first.
    async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<RunRecord>, StoreError>;

    async fn result(&self, id: Uuid) -> Result<Option<ResultSnapshot>, StoreError>;
}
