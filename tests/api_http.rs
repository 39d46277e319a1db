// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /api/status        (degraded before any fetch)
// - GET /api/quakes        (in-band failure, never 5xx)
// - GET /api/warnings/{a}  (payload contract for UI consumers)

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use bousai_feed::api;
use bousai_feed::config::Config;
use bousai_feed::fetch::{ConditionalFetch, ScriptedFetch};
use bousai_feed::service::FeedService;
use bousai_feed::store::{MemoryStore, SnapshotStore};

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

/// Build the same Router the binary uses.
fn test_router(fetcher: Arc<ScriptedFetch>) -> Router {
    let service = FeedService::new(
        Config::default(),
        Arc::new(MemoryStore::new()) as Arc<dyn SnapshotStore>,
        fetcher as Arc<dyn ConditionalFetch>,
    );
    api::create_router(service)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Json) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    let v: Json = serde_json::from_slice(&bytes).expect("parse json");
    (status, v)
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let app = test_router(Arc::new(ScriptedFetch::new()));

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("build GET /health");
    let resp = app.oneshot(req).await.expect("oneshot /health");
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    assert_eq!(String::from_utf8(bytes).expect("utf8").trim(), "ok");
}

#[tokio::test]
async fn api_status_is_degraded_before_any_fetch() {
    let app = test_router(Arc::new(ScriptedFetch::new()));
    let (status, v) = get_json(app, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["fetch_status"], "DEGRADED");
    assert!(v["updated_at"].is_null());
}

#[tokio::test]
async fn api_quakes_absorbs_upstream_failure() {
    let fetcher = Arc::new(ScriptedFetch::new());
    fetcher.push_error("connect timeout");
    fetcher.push_error("connect timeout");
    let app = test_router(fetcher);

    let (status, v) = get_json(app, "/api/quakes").await;
    assert_eq!(status, StatusCode::OK, "failure is in-band, never 5xx");
    assert_eq!(v["fetch_status"], "DEGRADED");
    assert!(v["quakes"].as_array().unwrap().is_empty());
    assert!(v["last_error"].is_string());
}

#[tokio::test]
async fn api_warnings_contract_for_ui() {
    let fetcher = Arc::new(ScriptedFetch::new());
    fetcher.push_fresh(
        r#"{ "reportDatetime": "2024-06-01T10:00:00+09:00",
             "areaTypes": [ { "areas": [
               { "code": "130010", "name": "東京地方",
                 "warnings": [ { "code": "03", "status": "発表" } ] } ] } ] }"#,
    );
    let app = test_router(fetcher);

    let (status, v) = get_json(app, "/api/warnings/130010").await;
    assert_eq!(status, StatusCode::OK);

    // Contract checks for UI consumers
    assert_eq!(v["fetch_status"], "OK");
    assert_eq!(v["confidence"], "HIGH");
    assert_eq!(v["area"], "130010");
    assert!(v["updated_at"].is_string());
    assert!(v["note"].is_string());

    let items = v["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["kind"], "大雨警報");
    assert_eq!(items[0]["severity"], "warning");

    let buckets = v["buckets"].as_array().unwrap();
    assert_eq!(buckets[0]["tier"], "warning");
}
