//! API endpoint modules.
//!
//! Shared error mapping lives here in mod.rs.

mod definitions;
mod health;
mod results;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use feedsync_engine::SyncError;

/// Error half of every handler's return type.
pub type ApiError = (StatusCode, Json<Value>);

/// Map a `SyncError` to an HTTP response.
pub(crate) fn sync_err(e: SyncError) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(error = %e, "sync request failed");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

// ── Re-exports ───────────────────────────────────────────────────

pub use definitions::{
    definitions_create, definitions_delete, definitions_get, definitions_history,
    definitions_list, definitions_result, definitions_run, definitions_update,
};
pub use health::{health, scheduler_metrics};
pub use results::tool_result;
