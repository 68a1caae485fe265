//! REST endpoint handlers for the status API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness, stream count, halted streams |
//! | `GET` | `/api/streams` | Status of every stream |
//! | `GET` | `/api/streams/{name}` | Status of one stream |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use geode_core::status::CursorState;

use crate::error::ObserverError;
use crate::state::AppState;

/// Report liveness. `status` is `degraded` while any stream is halted.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams = state.board.snapshot().await;
    let halted: Vec<&str> = streams
        .iter()
        .filter(|status| status.state == CursorState::Halted)
        .map(|status| status.name.as_str())
        .collect();
    let uptime_secs = Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();
    let overall = if halted.is_empty() { "ok" } else { "degraded" };

    Json(serde_json::json!({
        "status": overall,
        "streams": streams.len(),
        "halted": halted,
        "uptime_secs": uptime_secs,
    }))
}

/// List every registered stream, ordered by name.
pub async fn list_streams(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    let streams = state.board.snapshot().await;

    Ok(Json(serde_json::json!({
        "count": streams.len(),
        "streams": serde_json::to_value(&streams)?,
    })))
}

/// Return one stream's state, watermark, counters, and last error.
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ObserverError> {
    let status = state
        .board
        .get(&name)
        .await
        .ok_or_else(|| ObserverError::NotFound(format!("stream {name}")))?;

    Ok(Json(serde_json::to_value(status)?))
}
