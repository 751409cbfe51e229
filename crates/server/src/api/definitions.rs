//! CRUD, history and manual-run handlers for sync definitions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use feedsync_engine::{
    CreateSyncDefinition, LatestResult, RunOutcome, RunRecord, SyncDefinition,
    UpdateSyncDefinition,
};

use super::{sync_err, ApiError};
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub tool_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// GET /api/sync/definitions
pub async fn definitions_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SyncDefinition>>, ApiError> {
    let definitions = state
        .sync
        .list_definitions(params.tool_id.as_deref())
        .await
        .map_err(sync_err)?;
    Ok(Json(definitions))
}

/// POST /api/sync/definitions
pub async fn definitions_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSyncDefinition>,
) -> Result<(StatusCode, Json<SyncDefinition>), ApiError> {
    let definition = state.sync.create_definition(req).await.map_err(sync_err)?;
    Ok((StatusCode::CREATED, Json(definition)))
}

/// GET /api/sync/definitions/{id}
pub async fn definitions_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncDefinition>, ApiError> {
    let definition = state.sync.get_definition(id).await.map_err(sync_err)?;
    Ok(Json(definition))
}

/// PUT /api/sync/definitions/{id}
pub async fn definitions_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSyncDefinition>,
) -> Result<Json<SyncDefinition>, ApiError> {
    let definition = state
        .sync
        .update_definition(id, req)
        .await
        .map_err(sync_err)?;
    Ok(Json(definition))
}

/// DELETE /api/sync/definitions/{id}
pub async fn definitions_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.sync.delete_definition(id).await.map_err(sync_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/sync/definitions/{id}/history?limit=
pub async fn definitions_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let history = state.sync.get_history(id, limit).await.map_err(sync_err)?;
    Ok(Json(history))
}

/// POST /api/sync/definitions/{id}/run: run now, outside the schedule.
///
/// 409 when a run of the same definition is already in progress.
pub async fn definitions_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunOutcome>, ApiError> {
    match state.sync.run_now(id).await.map_err(sync_err)? {
        RunOutcome::AlreadyRunning => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("sync definition {} is already running", id),
                "outcome": "already_running",
            })),
        )),
        outcome => Ok(Json(outcome)),
    }
}

/// GET /api/sync/definitions/{id}/result (`null` until a run succeeds)
pub async fn definitions_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<LatestResult>>, ApiError> {
    let latest = state
        .sync
        .latest_result_for_definition(id)
        .await
        .map_err(sync_err)?;
    Ok(Json(latest))
}
