//! Read endpoint for tool consumers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use feedsync_engine::LatestResult;

use super::{sync_err, ApiError};
use crate::state::AppState;

/// GET /api/tools/{tool_id}/result
///
/// Last good payload with a staleness flag, or `null` if no run of the
/// tool's definitions has ever succeeded. Run failures never surface here.
pub async fn tool_result(
    State(state): State<Arc<AppState>>,
    Path(tool_id): Path<String>,
) -> Result<Json<Option<LatestResult>>, ApiError> {
    let latest = state
        .sync
        .get_latest_result(&tool_id)
        .await
        .map_err(sync_err)?;
    Ok(Json(latest))
}
