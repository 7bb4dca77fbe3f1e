// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /v1/ready
// - admission control (429 once the bucket is empty)
// - GET /v1/ws token checks

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`
use uuid::Uuid;

use feedhub::api::{self, AppState, StaticTokenAuthenticator};
use feedhub::realtime::{Hub, SessionConfig};
use feedhub::TokenBucket;

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

/// Build the router with a bucket of `burst` tokens that never refills.
fn test_router(burst: f64) -> Router {
    let (hub, _join) = Hub::spawn();
    let mut tokens = HashMap::new();
    tokens.insert("good-token".to_string(), Uuid::new_v4());
    let state = AppState {
        hub,
        session: SessionConfig::default(),
        auth: Arc::new(StaticTokenAuthenticator::new(tokens)),
        limiter: Arc::new(TokenBucket::new(burst, 0.0)),
    };
    api::router(state)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

async fn json_body(resp: axum::response::Response) -> Json {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn ready_reports_hub_state() {
    let app = test_router(10.0);
    let resp = app.oneshot(get("/v1/ready")).await.expect("oneshot /ready");
    assert_eq!(resp.status(), StatusCode::OK);

    let v = json_body(resp).await;
    assert_eq!(v["status"], "ok");
    assert_eq!(v["clients"], 0);
}

#[tokio::test]
async fn requests_beyond_burst_are_throttled() {
    let app = test_router(2.0);

    for _ in 0..2 {
        let resp = app.clone().oneshot(get("/v1/ready")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = app.clone().oneshot(get("/v1/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let v = json_body(resp).await;
    assert!(v["error"].as_str().unwrap().contains("Rate limit exceeded"));
}

#[tokio::test]
async fn websocket_requires_a_known_token() {
    let app = test_router(10.0);

    let resp = app.clone().oneshot(get("/v1/ws")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app.clone().oneshot(get("/v1/ws?token=nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp).await["error"], "invalid token");

    // Valid token, but a plain HTTP request cannot be upgraded.
    let resp = app.oneshot(get("/v1/ws?token=good-token")).await.unwrap();
    assert!(resp.status().is_client_error());
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}
