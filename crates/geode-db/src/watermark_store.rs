//! Per-stream watermarks on the `stream_watermarks` table.

use chrono::{DateTime, Utc};
use geode_core::store::StoreError;
use geode_core::watermark::WatermarkStore;
use sqlx::PgPool;

use crate::error::DbError;

/// Operations on the `stream_watermarks` table.
#[derive(Debug, Clone)]
pub struct WatermarkTable {
    pool: PgPool,
}

impl WatermarkTable {
    /// Bind the table to a pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The persisted watermark of `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load(&self, stream: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let watermark = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT watermark FROM stream_watermarks WHERE stream = $1",
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;
        Ok(watermark)
    }

    /// Upsert the watermark of `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn store(&self, stream: &str, watermark: DateTime<Utc>) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO stream_watermarks (stream, watermark, updated_at)
              VALUES ($1, $2, now())
              ON CONFLICT (stream) DO UPDATE
              SET watermark = EXCLUDED.watermark, updated_at = EXCLUDED.updated_at",
        )
        .bind(stream)
        .bind(watermark)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl WatermarkStore for WatermarkTable {
    async fn get(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.load(stream).await?)
    }

    async fn set(&self, stream: &str, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(self.store(stream, watermark).await?)
    }
}
