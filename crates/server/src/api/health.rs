//! Health and scheduler metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use feedsync_engine::SchedulerSnapshot;

use super::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    pub scheduler_enabled: bool,
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store_backend,
        scheduler_enabled: state.scheduler.is_some(),
        instance_id: state.sync.settings().holder_id.clone(),
        started_at: state.started_at,
    })
}

// ── Scheduler ─────────────────────────────────────────────────────

/// GET /api/sync/scheduler (503 when the scheduler is disabled)
pub async fn scheduler_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchedulerSnapshot>, ApiError> {
    let scheduler = state.scheduler.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "scheduler disabled on this instance" })),
        )
    })?;
    Ok(Json(scheduler.metrics()))
}
