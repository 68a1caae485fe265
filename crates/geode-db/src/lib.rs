//! `PostgreSQL` storage for the Geode session reconciler.
//!
//! Implements the [`SessionStore`](geode_core::store::SessionStore) and
//! [`WatermarkStore`](geode_core::watermark::WatermarkStore) seams of
//! `geode-core` on top of a shared connection pool.
//!
//! ```text
//! Reconciler --> SessionTable   --> sessions           (mac macaddr, ip inet, ...)
//! IngestCursor -> WatermarkTable --> stream_watermarks (one row per stream)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- Connection pool and migrations
//! - [`session_store`] -- Overlap lookups, writes, and transactional splits
//! - [`watermark_store`] -- Upserted per-stream watermarks
//! - [`error`] -- Shared error types

pub mod error;
pub mod postgres;
pub mod session_store;
pub mod watermark_store;

pub use error::DbError;
pub use postgres::PostgresPool;
pub use session_store::{SessionRow, SessionTable};
pub use watermark_store::WatermarkTable;
