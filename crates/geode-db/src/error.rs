//! Error types for the storage layer.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`sqlx`] errors. At the `geode-core` seam they are folded into
//! [`StoreError`], split into transient failures (worth retrying) and
//! everything else.

use geode_core::store::StoreError;
use geode_types::{KindTableError, SessionId};

/// SQLSTATE classes that describe a lost or overloaded server rather than a
/// bad statement: connection exception, transaction rollback, insufficient
/// resources, operator intervention.
const TRANSIENT_SQLSTATE_CLASSES: [&str; 4] = ["08", "40", "53", "57"];

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored kind code is not in the kind table.
    #[error("Kind translation error: {0}")]
    Kinds(#[from] KindTableError),

    /// A stored row cannot be turned back into a session.
    #[error("Corrupt session row {id}: {reason}")]
    Corrupt {
        /// Row id.
        id: i64,
        /// What is wrong with it.
        reason: String,
    },

    /// No row has the requested id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether retrying the same statement later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Postgres(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            TRANSIENT_SQLSTATE_CLASSES
                .iter()
                .any(|class| code.starts_with(class))
        }),
        _ => false,
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            return Self::Unavailable(err.to_string());
        }
        match err {
            DbError::NotFound(id) => Self::NotFound(id),
            other => Self::Corrupt(other.to_string()),
        }
    }
}
