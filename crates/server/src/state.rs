use std::sync::Arc;

use chrono::{DateTime, Utc};

use feedsync_engine::{SyncScheduler, SyncService};

/// Shared application state handed to every handler.
pub struct AppState {
    pub sync: SyncService,
    /// `None` when started with `--no-scheduler`.
    pub scheduler: Option<Arc<SyncScheduler>>,
    /// `"postgres"` or `"memory"`.
    pub store_backend: &'static str,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        sync: SyncService,
        scheduler: Option<Arc<SyncScheduler>>,
        store_backend: &'static str,
    ) -> Self {
        Self {
            sync,
            scheduler,
            store_backend,
            started_at: Utc::now(),
        }
    }
}
