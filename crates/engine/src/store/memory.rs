//! In-process [`SyncStore`] behind a single lock.
//!
//! Used by tests and when PostgreSQL is not configured. One `RwLock` guards
//! definitions, history, results and leases together, so every write is
//! atomic with respect to the others.

use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::types::{
    ErrorKind, Lease, RecordDisposition, ResultSnapshot, RunCompletion, RunRecord, RunStatus,
    SyncDefinition,
};

use super::{StoreError, SyncStore, UNRECORDED_RUN_ERROR};

#[derive(Debug, Default)]
struct MemoryState {
    /// Insertion order = creation order.
    definitions: IndexMap<Uuid, SyncDefinition>,
    /// Oldest first; capped at `history_cap`.
    history: HashMap<Uuid, VecDeque<RunRecord>>,
    results: HashMap<Uuid, ResultSnapshot>,
    leases: HashMap<Uuid, Lease>,
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    history_cap: usize,
}

impl MemoryStore {
    pub fn new(history_cap: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            history_cap: history_cap.max(1),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.state.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.state.write().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn insert_definition(&self, definition: &SyncDefinition) -> Result<(), StoreError> {
        self.write()?
            .definitions
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn list_definitions(
        &self,
        tool_id: Option<&str>,
    ) -> Result<Vec<SyncDefinition>, StoreError> {
        let state = self.read()?;
        Ok(state
            .definitions
            .values()
            .filter(|d| tool_id.map_or(true, |t| d.tool_id == t))
            .cloned()
            .collect())
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<SyncDefinition>, StoreError> {
        Ok(self.read()?.definitions.get(&id).cloned())
    }

    async fn update_config(
        &self,
        definition: &SyncDefinition,
        reschedule: bool,
    ) -> Result<SyncDefinition, StoreError> {
        let mut state = self.write()?;
        let stored = state
            .definitions
            .get_mut(&definition.id)
            .ok_or(StoreError::NotFound(definition.id))?;
        stored.tool_id = definition.tool_id.clone();
        stored.name = definition.name.clone();
        stored.request = definition.request.clone();
        stored.extract_path = definition.extract_path.clone();
        stored.transform_script = definition.transform_script.clone();
        stored.recurrence = definition.recurrence.clone();
        stored.is_active = definition.is_active;
        stored.updated_at = definition.updated_at;
        if reschedule {
            stored.next_run_at = definition.next_run_at;
        }
        Ok(stored.clone())
    }

    async fn delete_definition(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let existed = state.definitions.shift_remove(&id).is_some();
        state.history.remove(&id);
        state.results.remove(&id);
        state.leases.remove(&id);
        Ok(existed)
    }

    async fn due_definitions(&self, now: DateTime<Utc>) -> Result<Vec<SyncDefinition>, StoreError> {
        let state = self.read()?;
        Ok(state
            .definitions
            .values()
            .filter(|d| d.is_due(now))
            .cloned()
            .collect())
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut state = self.write()?;
        if let Some(existing) = state.leases.get(&id) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let definition = state
            .definitions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        definition.run_seq += 1;
        definition.last_status = RunStatus::Running;
        let lease = Lease {
            definition_id: id,
            holder: holder.to_string(),
            run_seq: definition.run_seq,
            acquired_at: now,
            expires_at: now + ttl,
        };
        state.leases.insert(id, lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let held = state
            .leases
            .get(&lease.definition_id)
            .is_some_and(|l| l.holder == lease.holder && l.run_seq == lease.run_seq);
        if !held {
            return Ok(());
        }
        state.leases.remove(&lease.definition_id);
        if let Some(definition) = state.definitions.get_mut(&lease.definition_id) {
            if definition.run_seq == lease.run_seq && definition.last_status == RunStatus::Running {
                definition.last_status = RunStatus::Failed;
                definition.last_error = Some(UNRECORDED_RUN_ERROR.to_string());
                definition.last_error_kind = Some(ErrorKind::Transient);
            }
        }
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

        let mut state = self.write()?;
        let Some(definition) = state.definitions.get_mut(&id) else {
            return Ok(RecordDisposition::Dropped(record));
        };

        definition.run_count += 1;
        match record.status {
            RunStatus::Success => definition.success_count += 1,
            _ => definition.fail_count += 1,
        }
        // A run that lost its lease to a newer one leaves the run state to it.
        if lease.run_seq >= definition.run_seq {
            definition.last_status = record.status;
            definition.last_error = record.error.clone();
            definition.last_error_kind = record.error_kind;
            definition.last_run_at = Some(record.started_at);
            definition.next_run_at = next_run_at;
        }

        let history = state.history.entry(id).or_default();
        let pos = history
            .iter()
            .rposition(|r| r.started_at <= record.started_at)
            .map_or(0, |p| p + 1);
        history.insert(pos, record.clone());
        while history.len() > self.history_cap {
            history.pop_front();
        }

        if record.status == RunStatus::Success {
            if let Some(payload) = payload {
                let newer = state
                    .results
                    .get(&id)
                    .map_or(true, |existing| existing.run_seq < lease.run_seq);
                if newer {
                    state.results.insert(
                        id,
                        ResultSnapshot {
                            definition_id: id,
                            payload,
                            produced_at: record.started_at,
                            run_seq: lease.run_seq,
                        },
                    );
                }
            }
        }

        Ok(RecordDisposition::Recorded(record))
    }

    async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .history
            .get(&id)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn result(&self, id: Uuid) -> Result<Option<ResultSnapshot>, StoreError> {
        Ok(self.read()?.results.get(&id).cloned())
    }
}
