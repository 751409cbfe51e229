//! HTTP contract tests against the router with an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use feedsync_engine::fetch::FetchError;
use feedsync_engine::{
    EngineSettings, Fetcher, MemoryStore, RequestSpec, ScheduleCalculator, SyncScheduler,
    SyncService, Transformer,
};
use feedsync_server::router::build_router;
use feedsync_server::state::AppState;

/// Serves a fixed payload; URLs containing "slow" take 300ms, "down" fail.
struct StaticFetcher;

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &RequestSpec) -> Result<Value, FetchError> {
        if request.url.contains("slow") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        if request.url.contains("down") {
            return Err(FetchError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(json!({"data": {"rates": [{"code": "EUR", "rate": 1.08}, {"code": "GBP", "rate": 1.27}]}}))
    }
}

fn app(with_scheduler: bool) -> Router {
    let service = SyncService::new(
        Arc::new(MemoryStore::new(10)),
        Arc::new(StaticFetcher),
        Transformer::default(),
        ScheduleCalculator::default(),
        EngineSettings::default(),
    );
    let scheduler = with_scheduler
        .then(|| Arc::new(SyncScheduler::new(service.clone(), Duration::from_secs(30), 2)));
    build_router(Arc::new(AppState::new(service, scheduler, "memory")), "*")
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn definition_body(url: &str) -> Value {
    json!({
        "tool_id": "fx-widget",
        "name": "FX rates",
        "request": {"url": url},
        "extract_path": "data.rates",
        "transform_script": "value | map(attribute=\"rate\") | list",
        "recurrence": {"frequency": "DAILY", "timezone": "Europe/Berlin"}
    })
}

#[tokio::test]
async fn health_reports_backend_and_scheduler() {
    let app = app(false);
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["scheduler_enabled"], false);

    let (status, body) = send(&app, "GET", "/api/sync/scheduler", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());

    let (status, body) = send(&self::app(true), "GET", "/api/sync/scheduler", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool_size"], 2);
    assert_eq!(body["ticks"], 0);
}

#[tokio::test]
async fn definition_crud_lifecycle() {
    let app = app(false);

    let (status, created) =
        send(&app, "POST", "/api/sync/definitions", Some(definition_body("https://api.example.com"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["last_status"], "PENDING");
    assert_eq!(created["run_count"], 0);
    assert_eq!(created["request"]["method"], "GET");
    assert!(created["next_run_at"].is_string());

    let (status, list) = send(&app, "GET", "/api/sync/definitions?tool_id=fx-widget", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    let (_, other) = send(&app, "GET", "/api/sync/definitions?tool_id=weather", None).await;
    assert!(other.as_array().unwrap().is_empty());

    let (status, updated) = send(
        &app,
        "PUT",
        &format!("/api/sync/definitions/{id}"),
        Some(json!({"name": null, "is_active": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(updated["name"].is_null());
    assert_eq!(updated["is_active"], false);
    assert_eq!(updated["extract_path"], "data.rates");

    let (status, fetched) = send(&app, "GET", &format!("/api/sync/definitions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, updated);

    let (status, _) = send(&app, "DELETE", &format!("/api/sync/definitions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, "GET", &format!("/api/sync/definitions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains(&id));
}

#[tokio::test]
async fn invalid_definitions_are_rejected() {
    let app = app(false);

    let mut bad_cron = definition_body("https://api.example.com");
    bad_cron["recurrence"] = json!({"frequency": "CUSTOM", "cron_expression": "61 * * * *", "timezone": "UTC"});
    let (status, body) = send(&app, "POST", "/api/sync/definitions", Some(bad_cron)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let mut bad_tz = definition_body("https://api.example.com");
    bad_tz["recurrence"]["timezone"] = json!("Mars/Olympus");
    let (status, _) = send(&app, "POST", "/api/sync/definitions", Some(bad_tz)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_url = definition_body("ftp://api.example.com");
    bad_url["extract_path"] = json!("data");
    let (status, _) = send(&app, "POST", "/api/sync/definitions", Some(bad_url)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Body that does not match the schema at all.
    let (status, _) = send(&app, "POST", "/api/sync/definitions", Some(json!({"tool_id": 5}))).await;
    assert!(status.is_client_error());

    let (_, list) = send(&app, "GET", "/api/sync/definitions", None).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn run_now_then_read_results() {
    let app = app(false);
    let (_, created) =
        send(&app, "POST", "/api/sync/definitions", Some(definition_body("https://api.example.com"))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", "/api/tools/fx-widget/result", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());

    let (status, outcome) = send(&app, "POST", &format!("/api/sync/definitions/{id}/run"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "completed");
    assert_eq!(outcome["status"], "SUCCESS");
    assert_eq!(outcome["trigger"], "manual");

    let (status, latest) = send(&app, "GET", "/api/tools/fx-widget/result", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["payload"], json!([1.08, 1.27]));
    assert_eq!(latest["stale"], false);
    assert!(latest["timestamp"].is_string());

    let (_, per_definition) =
        send(&app, "GET", &format!("/api/sync/definitions/{id}/result"), None).await;
    assert_eq!(per_definition, latest);

    let (status, history) =
        send(&app, "GET", &format!("/api/sync/definitions/{id}/history?limit=5"), None).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["payload_sample"], "[1.08,1.27]");
}

#[tokio::test]
async fn failed_run_keeps_consumers_on_last_good_result() {
    let app = app(false);
    let (_, good) =
        send(&app, "POST", "/api/sync/definitions", Some(definition_body("https://api.example.com"))).await;
    let (_, down) =
        send(&app, "POST", "/api/sync/definitions", Some(definition_body("https://down.example.com"))).await;
    let good_id = good["id"].as_str().unwrap().to_string();
    let down_id = down["id"].as_str().unwrap().to_string();

    send(&app, "POST", &format!("/api/sync/definitions/{good_id}/run"), None).await;
    let (status, outcome) =
        send(&app, "POST", &format!("/api/sync/definitions/{down_id}/run"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["status"], "FAILED");
    assert_eq!(outcome["error_kind"], "transient");
    assert!(outcome["error"].as_str().unwrap().starts_with("FetchError"));

    let (_, latest) = send(&app, "GET", "/api/tools/fx-widget/result", None).await;
    assert_eq!(latest["payload"], json!([1.08, 1.27]));

    let (_, down_def) = send(&app, "GET", &format!("/api/sync/definitions/{down_id}"), None).await;
    assert_eq!(down_def["last_status"], "FAILED");
    assert_eq!(down_def["last_error_kind"], "transient");
    assert_eq!(down_def["fail_count"], 1);
}

#[tokio::test]
async fn concurrent_run_returns_conflict() {
    let app = app(false);
    let (_, created) =
        send(&app, "POST", "/api/sync/definitions", Some(definition_body("https://slow.example.com"))).await;
    let id = created["id"].as_str().unwrap().to_string();
    let uri = format!("/api/sync/definitions/{id}/run");

    let (first, second) = tokio::join!(send(&app, "POST", &uri, None), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&app, "POST", &uri, None).await
    });
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::CONFLICT);
    assert_eq!(second.1["outcome"], "already_running");

    let (_, history) = send(&app, "GET", &format!("/api/sync/definitions/{id}/history"), None).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let app = app(false);
    let id = uuid::Uuid::new_v4();
    for (method, uri) in [
        ("GET", format!("/api/sync/definitions/{id}")),
        ("DELETE", format!("/api/sync/definitions/{id}")),
        ("POST", format!("/api/sync/definitions/{id}/run")),
        ("GET", format!("/api/sync/definitions/{id}/history")),
        ("GET", format!("/api/sync/definitions/{id}/result")),
    ] {
        let (status, body) = send(&app, method, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert!(body["error"].is_string());
    }
}
