//! Durable per-stream low-water marks.
//!
//! A watermark is the earliest source timestamp a stream still has to read.
//! It is only ever written after the store effects of everything before it
//! are durable.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::store::StoreError;

/// Persistence for stream watermarks.
pub trait WatermarkStore: Send + Sync {
    /// Return the persisted watermark for `stream`, if any.
    fn get(
        &self,
        stream: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send;

    /// Persist `watermark` for `stream`, replacing any previous value.
    fn set(
        &self,
        stream: &str,
        watermark: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<T: WatermarkStore> WatermarkStore for Arc<T> {
    fn get(
        &self,
        stream: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send {
        (**self).get(stream)
    }

    fn set(
        &self,
        stream: &str,
        watermark: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).set(stream, watermark)
    }
}
