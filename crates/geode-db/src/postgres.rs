//! Pool and schema for the `sessions` and `stream_watermarks` tables.
//!
//! Queries are built at runtime (not compile-time checked), so builds never
//! need a live database. Every value is bound as a parameter.

use std::sync::Arc;
use std::time::Duration;

use geode_core::config::DatabaseConfig;
use geode_types::KindTable;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::DbError;
use crate::session_store::SessionTable;
use crate::watermark_store::WatermarkTable;

/// How long a worker waits for a pooled connection before the store call
/// fails as unavailable.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections idle this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared connection pool. Cheap to clone; every table handle it gives out
/// draws from the same pool.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Open a pool from the `database` section of the config.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed and
    /// [`DbError::Postgres`] if no connection can be made.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        let options: PgConnectOptions = config
            .url
            .parse()
            .map_err(|e: sqlx::Error| DbError::Config(format!("invalid database URL: {e}")))?;
        let host = options.get_host().to_owned();
        let database = options.get_database().map(ToOwned::to_owned);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(options)
            .await?;

        tracing::info!(
            %host,
            database = database.as_deref().unwrap_or("<default>"),
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Open a pool for `url` with the default pool size.
    ///
    /// # Errors
    ///
    /// See [`PostgresPool::connect`].
    pub async fn connect_url(url: &str) -> Result<Self, DbError> {
        Self::connect(&DatabaseConfig {
            url: url.to_owned(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// Bring the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if a migration fails.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Session schema up to date");
        Ok(())
    }

    /// The `sessions` table, translating kinds through `kinds`.
    pub fn sessions(&self, kinds: Arc<KindTable>) -> SessionTable {
        SessionTable::new(self.pool.clone(), kinds)
    }

    /// The `stream_watermarks` table.
    pub fn watermarks(&self) -> WatermarkTable {
        WatermarkTable::new(self.pool.clone())
    }

    /// The raw pool, for maintenance queries outside the two tables.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wait for checked-out connections to return, then close them all.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}
