//! Shared application state for the status API.

use chrono::{DateTime, Utc};
use geode_core::status::StatusBoard;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`](std::sync::Arc) and injected via Axum's `State`
/// extractor. The board is the same one the stream workers write to.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Per-stream status published by the cursors.
    pub board: StatusBoard,
    /// When the process started.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Serve `board`, counting uptime from now.
    pub fn new(board: StatusBoard) -> Self {
        Self {
            board,
            started_at: Utc::now(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(StatusBoard::new())
    }
}
