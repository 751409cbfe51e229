//! Admin/read operations and the run flow shared by the scheduler and the
//! manual trigger.
//!
//! A run: take the lease → fetch → extract → transform → record (one atomic
//! write, `next_run_at` included) → release the lease. The lease is released
//! on every path; a panic inside the pipeline is caught and recorded as a
//! failed run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::extract::parse_path;
use crate::fetch::{validate_request, Fetcher};
use crate::pipeline::{payload_sample, Pipeline};
use crate::schedule::ScheduleCalculator;
use crate::store::{StoreError, SyncStore};
use crate::transform::Transformer;
use crate::types::{
    CreateSyncDefinition, ErrorKind, LatestResult, Lease, RecordDisposition, ResultSnapshot,
    RunCompletion, RunOutcome, RunRecord, RunStatus, SyncDefinition, TriggerKind,
    UpdateSyncDefinition,
};

/// Errors surfaced by service operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync definition not found: {0}")]
    NotFound(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

impl SyncError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::Store(e) => e.status_code(),
            Self::Internal(_) => 500,
        }
    }
}

/// Engine-wide knobs derived from the process config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Lease holder identity of this process.
    pub holder_id: String,
    pub lease_ttl: Duration,
    pub sample_bytes: usize,
    pub staleness_factor: f64,
}

impl EngineSettings {
    pub fn from_config(config: &feedsync_core::Config) -> Self {
        Self {
            holder_id: config.scheduler.instance_id.clone(),
            lease_ttl: Duration::seconds(config.scheduler.lease_ttl_secs as i64),
            sample_bytes: config.retention.sample_bytes,
            staleness_factor: config.retention.staleness_factor,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&feedsync_core::Config::default())
    }
}

/// Hours to wait when a recurrence can no longer be evaluated.
const FALLBACK_RESCHEDULE_HOURS: i64 = 1;

/// Owns the store and the pipeline; cheap to clone.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn SyncStore>,
    pipeline: Pipeline,
    calculator: ScheduleCalculator,
    settings: EngineSettings,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        fetcher: Arc<dyn Fetcher>,
        transformer: Transformer,
        calculator: ScheduleCalculator,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            pipeline: Pipeline::new(fetcher, transformer),
            calculator,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    // ── Admin surface ───────────────────────────────────────────────

    pub async fn list_definitions(
        &self,
        tool_id: Option<&str>,
    ) -> Result<Vec<SyncDefinition>, SyncError> {
        Ok(self.store.list_definitions(tool_id).await?)
    }

    pub async fn get_definition(&self, id: Uuid) -> Result<SyncDefinition, SyncError> {
        self.store
            .get_definition(id)
            .await?
            .ok_or(SyncError::NotFound(id))
    }

    /// Run records, most recent first, at most `limit`.
    pub async fn get_history(&self, id: Uuid, limit: usize) -> Result<Vec<RunRecord>, SyncError> {
        self.get_definition(id).await?;
        Ok(self.store.history(id, limit).await?)
    }

    /// Validate and persist a new definition. It is due immediately.
    pub async fn create_definition(
        &self,
        req: CreateSyncDefinition,
    ) -> Result<SyncDefinition, SyncError> {
        let definition = SyncDefinition::from_create(req, Utc::now());
        self.validate(&definition)?;
        self.store.insert_definition(&definition).await?;
        info!(
            definition_id = %definition.id,
            tool_id = %definition.tool_id,
            frequency = %definition.recurrence.frequency,
            "sync definition created"
        );
        Ok(definition)
    }

    /// Apply a partial update. Changing the recurrence, or re-activating,
    /// recomputes `next_run_at`.
    pub async fn update_definition(
        &self,
        id: Uuid,
        req: UpdateSyncDefinition,
    ) -> Result<SyncDefinition, SyncError> {
        let mut definition = self.get_definition(id).await?;
        let was_active = definition.is_active;
        let old_recurrence = definition.recurrence.clone();
        let now = Utc::now();

        definition.apply_update(req, now);
        self.validate(&definition)?;

        let reschedule =
            definition.recurrence != old_recurrence || (!was_active && definition.is_active);
        if reschedule {
            let next = self
                .calculator
                .next_due(&definition.recurrence, definition.last_run_at, now)
                .map_err(|e| SyncError::Validation(e.to_string()))?;
            definition.next_run_at = Some(next);
        }

        let stored = self.store.update_config(&definition, reschedule).await?;
        info!(definition_id = %id, reschedule, "sync definition updated");
        Ok(stored)
    }

    /// Delete a definition with its history and result.
    pub async fn delete_definition(&self, id: Uuid) -> Result<(), SyncError> {
        if !self.store.delete_definition(id).await? {
            return Err(SyncError::NotFound(id));
        }
        info!(definition_id = %id, "sync definition deleted");
        Ok(())
    }

    fn validate(&self, definition: &SyncDefinition) -> Result<(), SyncError> {
        if definition.tool_id.trim().is_empty() {
            return Err(SyncError::Validation("tool_id must not be empty".to_string()));
        }
        validate_request(&definition.request).map_err(|e| SyncError::Validation(e.to_string()))?;
        self.calculator
            .validate(&definition.recurrence)
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        if let Some(path) = &definition.extract_path {
            parse_path(path).map_err(|e| SyncError::Validation(e.to_string()))?;
        }
        if let Some(script) = &definition.transform_script {
            self.pipeline
                .transformer()
                .validate(script)
                .map_err(|e| SyncError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    // ── Read surface ────────────────────────────────────────────────

    /// Latest good payload of a tool across its definitions, or `None` if
    /// none has ever succeeded.
    pub async fn get_latest_result(&self, tool_id: &str) -> Result<Option<LatestResult>, SyncError> {
        let definitions = self.store.list_definitions(Some(tool_id)).await?;
        let mut best: Option<(SyncDefinition, ResultSnapshot)> = None;
        for definition in definitions {
            let Some(snapshot) = self.store.result(definition.id).await? else {
                continue;
            };
            let newer = best.as_ref().map_or(true, |(_, b)| {
                (snapshot.produced_at, snapshot.run_seq) > (b.produced_at, b.run_seq)
            });
            if newer {
                best = Some((definition, snapshot));
            }
        }
        Ok(best.map(|(definition, snapshot)| self.latest(&definition, snapshot, Utc::now())))
    }

    /// Latest good payload of one definition.
    pub async fn latest_result_for_definition(
        &self,
        id: Uuid,
    ) -> Result<Option<LatestResult>, SyncError> {
        let definition = self.get_definition(id).await?;
        let snapshot = self.store.result(id).await?;
        Ok(snapshot.map(|s| self.latest(&definition, s, Utc::now())))
    }

    fn latest(
        &self,
        definition: &SyncDefinition,
        snapshot: ResultSnapshot,
        now: DateTime<Utc>,
    ) -> LatestResult {
        let stale = self
            .calculator
            .is_stale(
                &definition.recurrence,
                snapshot.produced_at,
                now,
                self.settings.staleness_factor,
            )
            .unwrap_or_else(|e| {
                warn!(definition_id = %definition.id, error = %e, "staleness check failed");
                true
            });
        LatestResult {
            definition_id: snapshot.definition_id,
            payload: snapshot.payload,
            timestamp: snapshot.produced_at,
            stale,
        }
    }

    // ── Runs ────────────────────────────────────────────────────────

    /// Manual trigger. Works on inactive definitions too.
    ///
    /// The run is spawned, so it completes and releases its lease even if
    /// the caller stops waiting.
    pub async fn run_now(&self, id: Uuid) -> Result<RunOutcome, SyncError> {
        let service = self.clone();
        tokio::spawn(async move { service.execute(id, TriggerKind::Manual).await })
            .await
            .map_err(|e| SyncError::Internal(format!("manual run task failed: {e}")))?
    }

    /// Active definitions due at `now`.
    pub async fn due_definitions(&self, now: DateTime<Utc>) -> Result<Vec<SyncDefinition>, SyncError> {
        Ok(self.store.due_definitions(now).await?)
    }

    /// Run one definition under its single-flight lease.
    pub async fn execute(&self, id: Uuid, trigger: TriggerKind) -> Result<RunOutcome, SyncError> {
        let lease = match self
            .store
            .try_acquire_lease(id, &self.settings.holder_id, Utc::now(), self.settings.lease_ttl)
            .await?
        {
            Some(lease) => lease,
            None => {
                info!(definition_id = %id, trigger = %trigger, "run skipped: already running");
                return Ok(RunOutcome::AlreadyRunning);
            }
        };

        let outcome = self.run_with_lease(&lease, trigger).await;
        if let Err(e) = &outcome {
            error!(
                definition_id = %id,
                trigger = %trigger,
                error = %e,
                "sync run aborted before it was recorded"
            );
        }

        if let Err(e) = self.store.release_lease(&lease).await {
            warn!(definition_id = %id, error = %e, "failed to release lease; it will expire");
        }
        outcome
    }

    async fn run_with_lease(&self, lease: &Lease, trigger: TriggerKind) -> Result<RunOutcome, SyncError> {
        let id = lease.definition_id;
        let Some(definition) = self.store.get_definition(id).await? else {
            return Err(SyncError::NotFound(id));
        };

        let started_at = Utc::now();
        info!(
            definition_id = %id,
            tool_id = %definition.tool_id,
            run_seq = lease.run_seq,
            trigger = %trigger,
            "sync run started"
        );

        let result = AssertUnwindSafe(self.pipeline.run(&definition))
            .catch_unwind()
            .await;
        let finished_at = Utc::now();

        let (status, error, error_kind, payload) = match result {
            Ok(Ok(payload)) => (RunStatus::Success, None, None, Some(payload)),
            Ok(Err(stage)) => {
                warn!(
                    definition_id = %id,
                    stage = stage.stage(),
                    kind = %stage.kind(),
                    error = %stage,
                    "sync run failed"
                );
                (RunStatus::Failed, Some(stage.to_string()), Some(stage.kind()), None)
            }
            Err(_) => {
                warn!(definition_id = %id, "sync run panicked");
                (
                    RunStatus::Failed,
                    Some("internal error: run panicked".to_string()),
                    Some(ErrorKind::Transient),
                    None,
                )
            }
        };

        let next_run_at = match self
            .calculator
            .next_due(&definition.recurrence, Some(started_at), finished_at)
        {
            Ok(next) => next,
            Err(e) => {
                warn!(definition_id = %id, error = %e, "cannot compute next run; retrying in 1h");
                finished_at + Duration::hours(FALLBACK_RESCHEDULE_HOURS)
            }
        };

        let completion = RunCompletion {
            trigger,
            started_at,
            finished_at,
            status,
            error,
            error_kind,
            payload_sample: payload
                .as_ref()
                .map(|p| payload_sample(p, self.settings.sample_bytes)),
            payload,
            next_run_at: Some(next_run_at),
        };

        match self.store.record_run(lease, completion).await? {
            RecordDisposition::Recorded(record) => {
                info!(
                    definition_id = %id,
                    status = %record.status,
                    duration_ms = (record.finished_at - record.started_at).num_milliseconds(),
                    next_run_at = %next_run_at,
                    "sync run recorded"
                );
                Ok(RunOutcome::Completed(record))
            }
            RecordDisposition::Dropped(record) => {
                info!(definition_id = %id, "definition deleted mid-run; run record dropped");
                Ok(RunOutcome::Discarded(record))
            }
        }
    }
}
