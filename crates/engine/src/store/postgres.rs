//! PostgreSQL [`SyncStore`].
//!
//! Tables: `sync_definitions`, `sync_runs`, `sync_results`, `sync_leases`
//! (see `migrations/`). Children cascade on definition delete. Leases live
//! in the database so several instances can share the same definitions.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::types::{
    ErrorKind, Frequency, Lease, Recurrence, RecordDisposition, RequestSpec, ResultSnapshot,
    RunCompletion, RunRecord, RunStatus, SyncDefinition,
};

use super::{StoreError, SyncStore, UNRECORDED_RUN_ERROR};

const DEFINITION_COLUMNS: &str = "id, tool_id, name, request_json, extract_path, transform_script,
    frequency, cron_expression, timezone, is_active, last_run_at, next_run_at, last_status,
    last_error, last_error_kind, run_count, success_count, fail_count, run_seq,
    created_at, updated_at";

const RUN_COLUMNS: &str = "id, definition_id, run_seq, trigger_kind, started_at, finished_at,
    status, error, error_kind, payload_sample";

// ── Row mapping ──────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct DefinitionRow {
    id: Uuid,
    tool_id: String,
    name: Option<String>,
    request_json: serde_json::Value,
    extract_path: Option<String>,
    transform_script: Option<String>,
    frequency: String,
    cron_expression: Option<String>,
    timezone: Option<String>,
    is_active: bool,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    last_status: String,
    last_error: Option<String>,
    last_error_kind: Option<String>,
    run_count: i64,
    success_count: i64,
    fail_count: i64,
    run_seq: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DefinitionRow> for SyncDefinition {
    type Error = StoreError;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        let request: RequestSpec = serde_json::from_value(row.request_json)
            .map_err(|e| StoreError::Corrupt(format!("request_json of {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            tool_id: row.tool_id,
            name: row.name,
            request,
            extract_path: row.extract_path,
            transform_script: row.transform_script,
            recurrence: Recurrence {
                frequency: parse_label::<Frequency>(&row.frequency)?,
                cron_expression: row.cron_expression,
                timezone: row.timezone,
            },
            is_active: row.is_active,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            last_status: parse_label(&row.last_status)?,
            last_error: row.last_error,
            last_error_kind: row.last_error_kind.as_deref().map(parse_label).transpose()?,
            run_count: row.run_count.max(0) as u64,
            success_count: row.success_count.max(0) as u64,
            fail_count: row.fail_count.max(0) as u64,
            run_seq: row.run_seq.max(0) as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    definition_id: Uuid,
    run_seq: i64,
    trigger_kind: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status: String,
    error: Option<String>,
    error_kind: Option<String>,
    payload_sample: Option<String>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            definition_id: row.definition_id,
            run_seq: row.run_seq.max(0) as u64,
            trigger: parse_label(&row.trigger_kind)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status: parse_label(&row.status)?,
            error: row.error,
            error_kind: row.error_kind.as_deref().map(parse_label).transpose()?,
            payload_sample: row.payload_sample,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    definition_id: Uuid,
    payload: serde_json::Value,
    produced_at: DateTime<Utc>,
    run_seq: i64,
}

impl From<ResultRow> for ResultSnapshot {
    fn from(row: ResultRow) -> Self {
        Self {
            definition_id: row.definition_id,
            payload: row.payload,
            produced_at: row.produced_at,
            run_seq: row.run_seq.max(0) as u64,
        }
    }
}

fn parse_label<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("sync store database error: {}", e);
    StoreError::Database(e)
}

// ── Store ────────────────────────────────────────────────────────────

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
    history_cap: usize,
}

impl PgSyncStore {
    pub fn new(pool: PgPool, history_cap: usize) -> Self {
        Self {
            pool,
            history_cap: history_cap.max(1),
        }
    }

    fn rows_to_definitions(rows: Vec<DefinitionRow>) -> Result<Vec<SyncDefinition>, StoreError> {
        rows.into_iter().map(SyncDefinition::try_from).collect()
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn insert_definition(&self, d: &SyncDefinition) -> Result<(), StoreError> {
        let request_json = serde_json::to_value(&d.request)
            .map_err(|e| StoreError::Corrupt(format!("request of {}: {e}", d.id)))?;
        sqlx::query(
            "INSERT INTO sync_definitions (id, tool_id, name, request_json, extract_path,
                 transform_script, frequency, cron_expression, timezone, is_active,
                 next_run_at, last_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(d.id)
        .bind(&d.tool_id)
        .bind(&d.name)
        .bind(request_json)
        .bind(&d.extract_path)
        .bind(&d.transform_script)
        .bind(d.recurrence.frequency.as_str())
        .bind(&d.recurrence.cron_expression)
        .bind(&d.recurrence.timezone)
        .bind(d.is_active)
        .bind(d.next_run_at)
        .bind(d.last_status.as_str())
        .bind(d.created_at)
        .bind(d.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_definitions(
        &self,
        tool_id: Option<&str>,
    ) -> Result<Vec<SyncDefinition>, StoreError> {
        let rows = sqlx::query_as::<_, DefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM sync_definitions
             WHERE ($1::text IS NULL OR tool_id = $1)
             ORDER BY created_at ASC"
        ))
        .bind(tool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Self::rows_to_definitions(rows)
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<SyncDefinition>, StoreError> {
        let row = sqlx::query_as::<_, DefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM sync_definitions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(SyncDefinition::try_from).transpose()
    }

    async fn update_config(
        &self,
        d: &SyncDefinition,
        reschedule: bool,
    ) -> Result<SyncDefinition, StoreError> {
        let request_json = serde_json::to_value(&d.request)
            .map_err(|e| StoreError::Corrupt(format!("request of {}: {e}", d.id)))?;
        let row = sqlx::query_as::<_, DefinitionRow>(&format!(
            "UPDATE sync_definitions SET
                tool_id = $2,
                name = $3,
                request_json = $4,
                extract_path = $5,
                transform_script = $6,
                frequency = $7,
                cron_expression = $8,
                timezone = $9,
                is_active = $10,
                next_run_at = CASE WHEN $11 THEN $12 ELSE next_run_at END,
                updated_at = $13
             WHERE id = $1
             RETURNING {DEFINITION_COLUMNS}"
        ))
        .bind(d.id)
        .bind(&d.tool_id)
        .bind(&d.name)
        .bind(request_json)
        .bind(&d.extract_path)
        .bind(&d.transform_script)
        .bind(d.recurrence.frequency.as_str())
        .bind(&d.recurrence.cron_expression)
        .bind(&d.recurrence.timezone)
        .bind(d.is_active)
        .bind(reschedule)
        .bind(d.next_run_at)
        .bind(d.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(StoreError::NotFound(d.id)),
        }
    }

    async fn delete_definition(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_definitions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_definitions(&self, now: DateTime<Utc>) -> Result<Vec<SyncDefinition>, StoreError> {
        let rows = sqlx::query_as::<_, DefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM sync_definitions
             WHERE is_active = true
               AND (next_run_at IS NULL OR next_run_at <= $1)
             ORDER BY next_run_at ASC NULLS FIRST"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Self::rows_to_definitions(rows)
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT run_seq FROM sync_definitions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(current_seq) = exists else {
            return Err(StoreError::NotFound(id));
        };
        let run_seq = current_seq + 1;

        // Only an absent or expired lease is replaced.
        let taken = sqlx::query(
            "INSERT INTO sync_leases (definition_id, holder, run_seq, acquired_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (definition_id) DO UPDATE SET
                holder = EXCLUDED.holder,
                run_seq = EXCLUDED.run_seq,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
             WHERE sync_leases.expires_at <= $4",
        )
        .bind(id)
        .bind(holder)
        .bind(run_seq)
        .bind(now)
        .bind(now + ttl)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if taken.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }

        sqlx::query(
            "UPDATE sync_definitions SET run_seq = $2, last_status = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(run_seq)
        .bind(RunStatus::Running.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Some(Lease {
            definition_id: id,
            holder: holder.to_string(),
            run_seq: run_seq as u64,
            acquired_at: now,
            expires_at: now + ttl,
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let released = sqlx::query(
            "DELETE FROM sync_leases WHERE definition_id = $1 AND holder = $2 AND run_seq = $3",
        )
        .bind(lease.definition_id)
        .bind(&lease.holder)
        .bind(lease.run_seq as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if released.rows_affected() > 0 {
            sqlx::query(
                "UPDATE sync_definitions SET
                    last_status = 'FAILED',
                    last_error = $3,
                    last_error_kind = $4
                 WHERE id = $1 AND run_seq = $2 AND last_status = 'RUNNING'",
            )
            .bind(lease.definition_id)
            .bind(lease.run_seq as i64)
            .bind(UNRECORDED_RUN_ERROR)
            .bind(ErrorKind::Transient.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn record_run(
        &self,
        lease: &Lease,
        completion: RunCompletion,
    ) -> Result<RecordDisposition, StoreError> {
        let id = lease.definition_id;
        let payload = completion.payload.clone();
        let next_run_at = completion.next_run_at;
        let record = completion.into_record(Uuid::new_v4(), id, lease.run_seq);
        let run_seq = lease.run_seq as i64;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current_seq = sqlx::query_scalar::<_, i64>(
            "SELECT run_seq FROM sync_definitions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(current_seq) = current_seq else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(RecordDisposition::Dropped(record));
        };

        sqlx::query(&format!(
            "INSERT INTO sync_runs ({RUN_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(record.id)
        .bind(id)
        .bind(run_seq)
        .bind(record.trigger.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.error_kind.map(|k| k.as_str()))
        .bind(&record.payload_sample)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Keep the newest `history_cap` runs.
        sqlx::query(
            "DELETE FROM sync_runs WHERE definition_id = $1 AND id NOT IN (
                SELECT id FROM sync_runs WHERE definition_id = $1
                ORDER BY started_at DESC, run_seq DESC
                LIMIT $2
             )",
        )
        .bind(id)
        .bind(self.history_cap as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let success = record.status == RunStatus::Success;
        if run_seq >= current_seq {
            sqlx::query(
                "UPDATE sync_definitions SET
                    run_count = run_count + 1,
                    success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                    fail_count = fail_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                    last_status = $3,
                    last_error = $4,
                    last_error_kind = $5,
                    last_run_at = $6,
                    next_run_at = $7
                 WHERE id = $1",
            )
            .bind(id)
            .bind(success)
            .bind(record.status.as_str())
            .bind(&record.error)
            .bind(record.error_kind.map(|k| k.as_str()))
            .bind(record.started_at)
            .bind(next_run_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            // Superseded run: counters only.
            sqlx::query(
                "UPDATE sync_definitions SET
                    run_count = run_count + 1,
                    success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                    fail_count = fail_count + CASE WHEN $2 THEN 0 ELSE 1 END
                 WHERE id = $1",
            )
            .bind(id)
            .bind(success)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if success {
            if let Some(payload) = payload {
                sqlx::query(
                    "INSERT INTO sync_results (definition_id, payload, produced_at, run_seq)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (definition_id) DO UPDATE SET
                        payload = EXCLUDED.payload,
                        produced_at = EXCLUDED.produced_at,
                        run_seq = EXCLUDED.run_seq
                     WHERE sync_results.run_seq < EXCLUDED.run_seq",
                )
                .bind(id)
                .bind(payload)
                .bind(record.started_at)
                .bind(run_seq)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(RecordDisposition::Recorded(record))
    }

    async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs
             WHERE definition_id = $1
             ORDER BY started_at DESC, run_seq DESC
             LIMIT $2"
        ))
        .bind(id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn result(&self, id: Uuid) -> Result<Option<ResultSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, ResultRow>(
            "SELECT definition_id, payload, produced_at, run_seq
             FROM sync_results WHERE definition_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(ResultSnapshot::from))
    }
}
