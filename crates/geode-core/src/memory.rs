//! In-memory [`SessionStore`] and [`WatermarkStore`] implementations.
//!
//! Used by the test suites and by the ingest binary's dry-run mode. Every
//! operation takes one mutex, so a split is applied under a single lock and
//! is never observed half-done.

use std::collections::BTreeMap;
use std::future::{Future, ready};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use geode_types::{EventRecord, IdentityLookup, SessionId};

use crate::store::{FieldPatch, OrderPolicy, OverlapQuery, SessionStore, StoreError};
use crate::watermark::WatermarkStore;

#[derive(Debug, Default)]
struct Sessions {
    rows: BTreeMap<SessionId, EventRecord>,
    last_id: i64,
    failing_writes: usize,
}

impl Sessions {
    fn check_write(&mut self) -> Result<(), StoreError> {
        if self.failing_writes > 0 {
            self.failing_writes = self.failing_writes.saturating_sub(1);
            return Err(StoreError::Unavailable("injected write failure".to_owned()));
        }
        Ok(())
    }

    fn insert(&mut self, record: &EventRecord) -> Result<SessionId, StoreError> {
        self.last_id = self
            .last_id
            .checked_add(1)
            .ok_or_else(|| StoreError::Unavailable("session id space exhausted".to_owned()))?;
        let id = SessionId(self.last_id);
        let mut stored = record.clone();
        stored.id = Some(id);
        self.rows.insert(id, stored);
        Ok(id)
    }

    fn row_mut(&mut self, id: SessionId) -> Result<&mut EventRecord, StoreError> {
        self.rows.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

/// A session store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<Sessions>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Sessions) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut sessions)
    }

    /// Store `record` directly, bypassing injected failures.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the id space is exhausted.
    pub fn seed(&self, record: EventRecord) -> Result<SessionId, StoreError> {
        self.with(|sessions| sessions.insert(&record))
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, count: usize) {
        self.with(|sessions| sessions.failing_writes = count);
    }

    /// Return a copy of session `id`.
    pub fn get(&self, id: SessionId) -> Option<EventRecord> {
        self.with(|sessions| sessions.rows.get(&id).cloned())
    }

    /// Every stored session in id order.
    pub fn all(&self) -> Vec<EventRecord> {
        self.with(|sessions| sessions.rows.values().cloned().collect())
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.with(|sessions| sessions.rows.len())
    }

    /// Whether no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, query: &OverlapQuery) -> Option<EventRecord> {
        self.with(|sessions| {
            let candidates = sessions.rows.values().filter(|row| {
                has_identity(row, &query.key) && row.interval.overlaps(&query.window)
            });
            let best = match query.order {
                OrderPolicy::LatestStop => candidates.max_by_key(|row| (row.stop(), row.id)),
                OrderPolicy::NewestFirst => candidates.max_by_key(|row| row.id),
            };
            best.cloned()
        })
    }
}

fn has_identity(row: &EventRecord, key: &IdentityLookup) -> bool {
    let stored = match key {
        IdentityLookup::Mac(_) => row.identity.mac.as_deref(),
        IdentityLookup::Ip(_) => row.identity.ip.as_deref(),
    };
    stored == Some(key.value())
}

impl SessionStore for MemoryStore {
    fn find_overlapping(
        &self,
        query: &OverlapQuery,
    ) -> impl Future<Output = Result<Option<EventRecord>, StoreError>> + Send {
        ready(Ok(self.find(query)))
    }

    fn insert(
        &self,
        record: &EventRecord,
    ) -> impl Future<Output = Result<SessionId, StoreError>> + Send {
        ready(self.with(|sessions| {
            sessions.check_write()?;
            sessions.insert(record)
        }))
    }

    fn overwrite(
        &self,
        id: SessionId,
        record: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        ready(self.with(|sessions| {
            sessions.check_write()?;
            let row = sessions.row_mut(id)?;
            *row = EventRecord {
                id: Some(id),
                ..record.clone()
            };
            Ok(())
        }))
    }

    fn patch_fields(
        &self,
        id: SessionId,
        patch: &FieldPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        ready(self.with(|sessions| {
            sessions.check_write()?;
            patch.apply(sessions.row_mut(id)?)
        }))
    }

    fn terminate_and_insert(
        &self,
        id: SessionId,
        stop: DateTime<Utc>,
        successor: &EventRecord,
    ) -> impl Future<Output = Result<SessionId, StoreError>> + Send {
        ready(self.with(|sessions| {
            sessions.check_write()?;
            let truncated = sessions
                .row_mut(id)?
                .interval
                .with_stop(stop)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            let successor = sessions.insert(successor)?;
            sessions.row_mut(id)?.interval = truncated;
            Ok(successor)
        }))
    }
}

/// Stream watermarks held in process memory.
#[derive(Debug, Default)]
pub struct MemoryWatermarks {
    marks: Mutex<BTreeMap<String, DateTime<Utc>>>,
    failing_writes: Mutex<usize>,
}

impl MemoryWatermarks {
    /// Create an empty watermark store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the watermark for `stream` without going through the trait.
    pub fn peek(&self, stream: &str) -> Option<DateTime<Utc>> {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .copied()
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_writes(&self, count: usize) {
        *self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = count;
    }
}

impl WatermarkStore for MemoryWatermarks {
    fn get(
        &self,
        stream: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send {
        ready(Ok(self.peek(stream)))
    }

    fn set(
        &self,
        stream: &str,
        watermark: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let mut failing = self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let result = if *failing > 0 {
            *failing = failing.saturating_sub(1);
            Err(StoreError::Unavailable("injected watermark failure".to_owned()))
        } else {
            self.marks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(stream.to_owned(), watermark);
            Ok(())
        };
        ready(result)
    }
}
