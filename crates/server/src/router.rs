//! HTTP router construction.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api;
use crate::state::AppState;

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>, cors_origin: &str) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/sync/scheduler", get(api::scheduler_metrics))
        .route(
            "/api/sync/definitions",
            get(api::definitions_list).post(api::definitions_create),
        )
        .route(
            "/api/sync/definitions/{id}",
            get(api::definitions_get)
                .put(api::definitions_update)
                .delete(api::definitions_delete),
        )
        .route("/api/sync/definitions/{id}/history", get(api::definitions_history))
        .route("/api/sync/definitions/{id}/run", post(api::definitions_run))
        .route("/api/sync/definitions/{id}/result", get(api::definitions_result))
        .route("/api/tools/{tool_id}/result", get(api::tool_result))
        .layer(cors_layer(cors_origin))
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!("Invalid CORS_ORIGIN '{}': {} (falling back to permissive)", origin, e);
            CorsLayer::permissive()
        }
    }
}
