//! Periodic tick loop dispatching due definitions into a bounded pool.
//!
//! Each tick lists active definitions whose `next_run_at` has passed and
//! spawns one run per definition while pool permits last. Definitions still
//! in flight on this instance are skipped; the remaining due definitions
//! wait for the next tick once the pool is full. Cross-instance exclusion is
//! the lease taken inside [`SyncService::execute`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::service::{SyncError, SyncService};
use crate::types::{RunOutcome, RunStatus, TriggerKind};

/// Scheduler counters, updated lock-free from worker tasks.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub ticks: AtomicU64,
    pub dispatched: AtomicU64,
    pub skipped_in_flight: AtomicU64,
    pub skipped_pool_full: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    /// Lease held elsewhere when the run started.
    pub conflicts: AtomicU64,
    /// Definition deleted mid-run.
    pub discarded: AtomicU64,
    /// Store errors outside a run.
    pub errors: AtomicU64,
}

/// Point-in-time view of the scheduler for the API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub skipped_in_flight: u64,
    pub skipped_pool_full: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub discarded: u64,
    pub errors: u64,
    pub active_runs: usize,
    pub pool_size: usize,
    pub tick_interval_secs: u64,
}

/// Removes a definition from the local in-flight set when the run ends,
/// including on panic.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

/// The sync scheduler.
pub struct SyncScheduler {
    service: SyncService,
    tick_interval: Duration,
    pool: Arc<Semaphore>,
    pool_size: usize,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    metrics: Arc<SchedulerMetrics>,
}

impl SyncScheduler {
    pub fn new(service: SyncService, tick_interval: Duration, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            service,
            tick_interval,
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    pub fn from_config(service: SyncService, config: &feedsync_core::config::SchedulerConfig) -> Self {
        Self::new(
            service,
            Duration::from_secs(config.tick_interval_secs),
            config.worker_pool_size,
        )
    }

    pub fn metrics(&self) -> SchedulerSnapshot {
        let m = &self.metrics;
        SchedulerSnapshot {
            ticks: m.ticks.load(Ordering::Relaxed),
            dispatched: m.dispatched.load(Ordering::Relaxed),
            skipped_in_flight: m.skipped_in_flight.load(Ordering::Relaxed),
            skipped_pool_full: m.skipped_pool_full.load(Ordering::Relaxed),
            succeeded: m.succeeded.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            conflicts: m.conflicts.load(Ordering::Relaxed),
            discarded: m.discarded.load(Ordering::Relaxed),
            errors: m.errors.load(Ordering::Relaxed),
            active_runs: self.pool_size - self.pool.available_permits(),
            pool_size: self.pool_size,
            tick_interval_secs: self.tick_interval.as_secs(),
        }
    }

    /// One scheduling pass. Returns the number of runs dispatched.
    pub async fn tick(&self) -> Result<usize, SyncError> {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let due = self.service.due_definitions(Utc::now()).await?;

        let mut dispatched = 0;
        for (i, definition) in due.iter().enumerate() {
            let id = definition.id;
            let already = self
                .in_flight
                .lock()
                .map(|set| set.contains(&id))
                .unwrap_or(true);
            if already {
                self.metrics.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
                debug!(definition_id = %id, "scheduler: still in flight, skipping");
                continue;
            }

            let permit = match Arc::clone(&self.pool).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    let remaining = &due[i..];
                    let busy = self
                        .in_flight
                        .lock()
                        .map(|set| remaining.iter().filter(|d| set.contains(&d.id)).count())
                        .unwrap_or(0);
                    let waiting = (remaining.len() - busy) as u64;
                    self.metrics.skipped_in_flight.fetch_add(busy as u64, Ordering::Relaxed);
                    self.metrics.skipped_pool_full.fetch_add(waiting, Ordering::Relaxed);
                    debug!(waiting, "scheduler: worker pool full, deferring to next tick");
                    break;
                }
            };

            if let Ok(mut set) = self.in_flight.lock() {
                set.insert(id);
            }
            let guard = InFlightGuard {
                set: Arc::clone(&self.in_flight),
                id,
            };
            let service = self.service.clone();
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                match service.execute(id, TriggerKind::Scheduled).await {
                    Ok(RunOutcome::Completed(record)) if record.status == RunStatus::Success => {
                        metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(RunOutcome::Completed(_)) => {
                        metrics.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(RunOutcome::AlreadyRunning) => {
                        metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(RunOutcome::Discarded(_)) => {
                        metrics.discarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        metrics.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(definition_id = %id, error = %e, "scheduler: run could not be executed");
                    }
                }
            });

            self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Wait until every dispatched run has finished.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.pool.acquire_many(self.pool_size as u32).await {
            drop(all);
        }
    }

    /// Run the tick loop until `shutdown` flips to `true` (or its sender is
    /// dropped), then drain in-flight runs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "sync scheduler started (tick interval: {}s, workers: {})",
            self.tick_interval.as_secs(),
            self.pool_size
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "scheduler: failed to query due definitions");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("sync scheduler draining in-flight runs");
        self.wait_idle().await;
        info!("sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::fetch::{FetchError, Fetcher};
    use crate::schedule::ScheduleCalculator;
    use crate::service::EngineSettings;
    use crate::store::MemoryStore;
    use crate::transform::Transformer;
    use crate::types::{CreateSyncDefinition, Frequency, Recurrence, RequestSpec};

    struct SlowFetcher(Duration);

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self, _request: &RequestSpec) -> Result<serde_json::Value, FetchError> {
            tokio::time::sleep(self.0).await;
            Ok(json!({"ok": true}))
        }
    }

    fn service(delay: Duration) -> SyncService {
        SyncService::new(
            Arc::new(MemoryStore::new(10)),
            Arc::new(SlowFetcher(delay)),
            Transformer::default(),
            ScheduleCalculator::default(),
            EngineSettings::default(),
        )
    }

    async fn add(svc: &SyncService, active: bool) -> Uuid {
        svc.create_definition(CreateSyncDefinition {
            tool_id: "fx".into(),
            name: None,
            request: RequestSpec::get("https://api.example.com"),
            extract_path: None,
            transform_script: None,
            recurrence: Recurrence::fixed(Frequency::Hourly),
            is_active: active,
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_tick_runs_due_definitions_once() {
        let svc = service(Duration::from_millis(10));
        let a = add(&svc, true).await;
        let inactive = add(&svc, false).await;
        let scheduler = SyncScheduler::new(svc.clone(), Duration::from_secs(30), 4);

        assert_eq!(scheduler.tick().await.unwrap(), 1);
        scheduler.wait_idle().await;

        let def = svc.get_definition(a).await.unwrap();
        assert_eq!(def.last_status, RunStatus::Success);
        assert_eq!(def.next_run_at, def.last_run_at.map(|t| t + chrono::Duration::hours(1)));
        assert_eq!(svc.get_definition(inactive).await.unwrap().run_count, 0);

        // Nothing is due any more.
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let m = scheduler.metrics();
        assert_eq!(m.ticks, 2);
        assert_eq!(m.dispatched, 1);
        assert_eq!(m.succeeded, 1);
        assert_eq!(m.active_runs, 0);
    }

    #[tokio::test]
    async fn test_full_pool_defers_and_in_flight_is_skipped() {
        let svc = service(Duration::from_millis(300));
        let a = add(&svc, true).await;
        let b = add(&svc, true).await;
        let scheduler = SyncScheduler::new(svc.clone(), Duration::from_secs(30), 1);

        assert_eq!(scheduler.tick().await.unwrap(), 1);
        // `a` is still running and `b` has no permit.
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let m = scheduler.metrics();
        assert_eq!(m.active_runs, 1);
        assert_eq!(m.skipped_in_flight, 1);
        assert_eq!(m.skipped_pool_full, 2);

        scheduler.wait_idle().await;
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        scheduler.wait_idle().await;

        for id in [a, b] {
            let def = svc.get_definition(id).await.unwrap();
            assert_eq!(def.run_count, 1);
            assert_eq!(def.run_count, def.success_count + def.fail_count);
        }
    }

    #[tokio::test]
    async fn test_pool_full_counts_only_idle_definitions() {
        let svc = service(Duration::from_millis(10));
        add(&svc, true).await;
        add(&svc, true).await;
        let busy = add(&svc, true).await;
        let scheduler = SyncScheduler::new(svc, Duration::from_secs(30), 1);

        let _held = Arc::clone(&scheduler.pool).try_acquire_owned().unwrap();
        scheduler.in_flight.lock().unwrap().insert(busy);

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let m = scheduler.metrics();
        assert_eq!(m.skipped_pool_full, 2);
        assert_eq!(m.skipped_in_flight, 1);
        assert_eq!(m.dispatched, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_runs() {
        let svc = service(Duration::from_millis(200));
        let a = add(&svc, true).await;
        let scheduler = Arc::new(SyncScheduler::new(svc.clone(), Duration::from_millis(50), 2));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // The run finished before `run` returned.
        let def = svc.get_definition(a).await.unwrap();
        assert_eq!(def.last_status, RunStatus::Success);
        assert_eq!(scheduler.metrics().active_runs, 0);
    }
}
