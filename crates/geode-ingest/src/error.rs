//! Error types for the ingestion binary.
//!
//! [`IngestError`] wraps every failure mode of startup and of the stream
//! workers so `main` can propagate with `?`.

use geode_core::config::ConfigError;
use geode_core::cursor::CursorError;
use geode_db::DbError;
use geode_observer::ServerError;

/// Top-level error for the ingestion binary.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// Connecting to or migrating the database failed.
    #[error("database error: {source}")]
    Database {
        /// The underlying database error.
        #[from]
        source: DbError,
    },

    /// The status server failed.
    #[error("status server error: {source}")]
    Server {
        /// The underlying server error.
        #[from]
        source: ServerError,
    },

    /// The search client could not be built.
    #[error("source error: {message}")]
    Source {
        /// Description of the failure.
        message: String,
    },

    /// A stream worker stopped on a fatal error.
    #[error("stream {stream} halted: {source}")]
    Stream {
        /// The stream name.
        stream: String,
        /// The fatal cursor error.
        source: CursorError,
    },
}
