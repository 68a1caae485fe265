//! Axum router construction for the status API.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the complete Axum router for the status server.
///
/// The router includes:
/// - `GET /health` -- liveness and halted-stream count
/// - `GET /api/streams` -- every stream's status
/// - `GET /api/streams/{name}` -- one stream's status
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/streams", get(handlers::list_streams))
        .route("/api/streams/{name}", get(handlers::get_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
