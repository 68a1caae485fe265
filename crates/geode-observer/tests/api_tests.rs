//! Integration tests for the status API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use geode_core::policy::PolicyKind;
use geode_core::status::{CursorState, StatusBoard};
use geode_observer::router::build_router;
use geode_observer::state::AppState;
use serde_json::Value;
use tower::ServiceExt;

async fn make_test_state() -> Arc<AppState> {
    let board = StatusBoard::new();
    board.register("dhcp", PolicyKind::Lease).await;
    board.register("tomcat", PolicyKind::Info).await;
    board
        .update("dhcp", |status| {
            status.state = CursorState::Idle;
            status.watermark = Utc.with_ymd_and_hms(2016, 11, 22, 11, 55, 0).single();
            status.stats.pages = 3;
            status.stats.inserted = 2;
        })
        .await;
    Arc::new(AppState::new(board))
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(state: Arc<AppState>, path: &str) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

#[tokio::test]
async fn test_health_ok() {
    let (status, json) = get(make_test_state().await, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["streams"], 2);
    assert_eq!(json["halted"], serde_json::json!([]));
}

#[tokio::test]
async fn test_health_degraded_when_a_stream_halts() {
    let state = make_test_state().await;
    state
        .board
        .update("tomcat", |status| {
            status.state = CursorState::Halted;
            status.last_error = Some("inconsistent time comparison".to_owned());
        })
        .await;

    let (status, json) = get(state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["halted"], serde_json::json!(["tomcat"]));
}

#[tokio::test]
async fn test_list_streams() {
    let (status, json) = get(make_test_state().await, "/api/streams").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    assert_eq!(json["streams"][0]["name"], "dhcp");
    assert_eq!(json["streams"][0]["policy"], "lease");
    assert_eq!(json["streams"][1]["name"], "tomcat");
}

#[tokio::test]
async fn test_get_stream() {
    let (status, json) = get(make_test_state().await, "/api/streams/dhcp").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "idle");
    assert_eq!(json["watermark"], "2016-11-22T11:55:00Z");
    assert_eq!(json["stats"]["pages"], 3);
    assert_eq!(json["stats"]["inserted"], 2);
    assert!(json["last_error"].is_null());
}

#[tokio::test]
async fn test_get_stream_not_found() {
    let (status, json) = get(make_test_state().await, "/api/streams/radius").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], 404);
    assert_eq!(json["error"], "stream radius");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let response = build_router(make_test_state().await)
        .oneshot(Request::get("/api/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
