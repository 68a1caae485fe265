//! The session store abstraction the reconciler writes through.
//!
//! Implementations must give read-after-write consistency within one
//! caller's serialized access. [`SessionStore::terminate_and_insert`] must
//! be atomic: either both the truncated candidate and its successor are
//! durable or neither is.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use geode_types::{AttributeKey, EventRecord, IdentityLookup, Interval, SessionId};

/// Candidate preference when several stored sessions overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderPolicy {
    /// Latest `stop` first, ties broken by the largest id.
    #[default]
    LatestStop,
    /// Largest id (most recently created) first.
    NewestFirst,
}

/// A single-key overlap lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapQuery {
    /// Identity column and value to match exactly.
    pub key: IdentityLookup,
    /// Interval the stored session must overlap (buffer already applied).
    pub window: Interval,
    /// Which overlapping session to return.
    pub order: OrderPolicy,
}

/// A narrow in-place update of a stored session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPatch {
    /// New stop time, if it changes.
    pub stop: Option<DateTime<Utc>>,
    /// Scalar fields to overwrite.
    pub fields: BTreeMap<AttributeKey, String>,
}

impl FieldPatch {
    /// A patch that only moves the stop time.
    pub fn stop_at(stop: DateTime<Utc>) -> Self {
        Self {
            stop: Some(stop),
            fields: BTreeMap::new(),
        }
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.stop.is_none() && self.fields.is_empty()
    }

    /// Apply the patch to an in-memory copy of a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the new stop precedes the start.
    pub fn apply(&self, record: &mut EventRecord) -> Result<(), StoreError> {
        if let Some(stop) = self.stop {
            record.interval = record
                .interval
                .with_stop(stop)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        }
        for (&key, value) in &self.fields {
            record.set(key, Some(value.clone()));
        }
        Ok(())
    }
}

/// Errors surfaced by a [`SessionStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or the write did not commit.
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be turned into a valid record.
    #[error("corrupt session row: {0}")]
    Corrupt(String),

    /// The referenced session does not exist.
    #[error("session {0} not found")]
    NotFound(SessionId),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable storage of session records.
pub trait SessionStore: Send + Sync {
    /// Return the preferred stored session for `query.key` whose interval
    /// overlaps `query.window`.
    fn find_overlapping(
        &self,
        query: &OverlapQuery,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send;

    /// Store a new session and return its id.
    fn insert(
        &self,
        record: &EventRecord,
    ) -> impl Future<Output = Result<SessionId, StoreError>> + Send;

    /// Replace every field of session `id` with `record`.
    fn overwrite(
        &self,
        id: SessionId,
        record: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Update only the fields named by `patch`.
    fn patch_fields(
        &self,
        id: SessionId,
        patch: &FieldPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically set the stop of session `id` and insert `successor`.
    fn terminate_and_insert(
        &self,
        id: SessionId,
        stop: DateTime<Utc>,
        successor: &EventRecord,
    ) -> impl Future<Output = Result<SessionId, StoreError>> + Send;
}

impl<T: SessionStore> SessionStore for Arc<T> {
    fn find_overlapping(
        &self,
        query: &OverlapQuery,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send {
        (**self).find_overlapping(query)
    }

    fn insert(
        &self,
        record: &EventRecord,
    ) -> impl Future<Output = Result<SessionId, StoreError>> + Send {
        (**self).insert(record)
    }

    fn overwrite(
        &self,
        id: SessionId,
        record: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).overwrite(id, record)
    }

    fn patch_fields(
        &self,
        id: SessionId,
        patch: &FieldPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).patch_fields(id, patch)
    }

    fn terminate_and_insert(
        &self,
        id: SessionId,
        stop: DateTime<Utc>,
        successor: &EventRecord,
    ) -> impl Future<Output = Result<SessionId, StoreError>> + Send {
        (**self).terminate_and_insert(id, stop, successor)
    }
}
