//! Status API server for the Geode session reconciler.
//!
//! This crate provides an Axum HTTP server that exposes, read-only, what
//! every stream worker publishes to the shared
//! [`StatusBoard`](geode_core::status::StatusBoard):
//!
//! - **Liveness** (`/health`) with a count of halted streams
//! - **Stream list** (`/api/streams`) with cursor state, watermark, and
//!   counters per stream
//! - **Stream detail** (`/api/streams/{name}`)
//!
//! Handlers only take read locks on the board, so a slow client never
//! holds up a cursor.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

// Re-export primary types for convenience.
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
