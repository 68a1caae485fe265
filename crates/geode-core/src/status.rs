//! Live per-stream status shared between cursors and the status API.
//!
//! Each [`IngestCursor`](crate::cursor::IngestCursor) publishes its state,
//! watermark, counters, and last error to a [`StatusBoard`]. The observer
//! crate serves snapshots of the board over HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::policy::PolicyKind;
use crate::reconcile::Outcome;

/// Where a stream's cursor is in its loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    /// Caught up with the safety horizon, waiting to poll.
    #[default]
    Idle,
    /// Waiting on a source query.
    Fetching,
    /// Reconciling a page of observations.
    Draining,
    /// Persisting the watermark.
    Checkpointing,
    /// Waiting out a retry delay after a failure.
    Backoff,
    /// Stopped on a fatal error.
    Halted,
}

/// Counters accumulated by one stream since the process started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Pages fetched from the source.
    pub pages: u64,
    /// Raw observations received.
    pub observations: u64,
    /// New sessions inserted.
    pub inserted: u64,
    /// Sessions merged wholesale.
    pub merged: u64,
    /// Sessions whose stop was extended.
    pub extended: u64,
    /// Sessions patched in place.
    pub patched: u64,
    /// Sessions terminated and split.
    pub split: u64,
    /// Observations already incorporated.
    pub unchanged: u64,
    /// Observations dropped as malformed or unidentifiable.
    pub dropped: u64,
    /// Page-level failures that led to a backoff.
    pub failures: u64,
}

impl StreamStats {
    /// Count one reconciliation outcome.
    pub const fn record(&mut self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Inserted(_) => &mut self.inserted,
            Outcome::Merged(_) => &mut self.merged,
            Outcome::Extended(_) => &mut self.extended,
            Outcome::Patched(_) => &mut self.patched,
            Outcome::Split { .. } => &mut self.split,
            Outcome::Unchanged(_) => &mut self.unchanged,
        };
        *counter = counter.saturating_add(1);
    }

    /// Count one dropped observation.
    pub const fn record_dropped(&mut self) {
        self.dropped = self.dropped.saturating_add(1);
    }

    /// Add another set of counters into this one.
    pub const fn absorb(&mut self, other: &Self) {
        self.pages = self.pages.saturating_add(other.pages);
        self.observations = self.observations.saturating_add(other.observations);
        self.inserted = self.inserted.saturating_add(other.inserted);
        self.merged = self.merged.saturating_add(other.merged);
        self.extended = self.extended.saturating_add(other.extended);
        self.patched = self.patched.saturating_add(other.patched);
        self.split = self.split.saturating_add(other.split);
        self.unchanged = self.unchanged.saturating_add(other.unchanged);
        self.dropped = self.dropped.saturating_add(other.dropped);
        self.failures = self.failures.saturating_add(other.failures);
    }
}

/// Everything the status API reports about one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// Stream name.
    pub name: String,
    /// Policy family the stream reconciles with.
    pub policy: PolicyKind,
    /// Current cursor state.
    pub state: CursorState,
    /// Last persisted watermark.
    pub watermark: Option<DateTime<Utc>>,
    /// Wall-clock time of the last successful checkpoint.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Most recent page-level error, cleared on the next checkpoint.
    pub last_error: Option<String>,
    /// Counters.
    pub stats: StreamStats,
}

impl StreamStatus {
    /// A fresh status for a stream that has not run yet.
    pub fn new(name: String, policy: PolicyKind) -> Self {
        Self {
            name,
            policy,
            state: CursorState::Idle,
            watermark: None,
            last_checkpoint_at: None,
            last_error: None,
            stats: StreamStats::default(),
        }
    }
}

/// Shared, cloneable registry of stream statuses.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    streams: Arc<RwLock<BTreeMap<String, StreamStatus>>>,
}

impl StatusBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream, replacing any previous entry with the same name.
    pub async fn register(&self, name: &str, policy: PolicyKind) {
        self.streams
            .write()
            .await
            .insert(name.to_owned(), StreamStatus::new(name.to_owned(), policy));
    }

    /// Mutate one stream's status. Unknown streams are ignored.
    pub async fn update(&self, name: &str, f: impl FnOnce(&mut StreamStatus) + Send) {
        if let Some(status) = self.streams.write().await.get_mut(name) {
            f(status);
        }
    }

    /// Current status of one stream.
    pub async fn get(&self, name: &str) -> Option<StreamStatus> {
        self.streams.read().await.get(name).cloned()
    }

    /// Current status of every stream, ordered by name.
    pub async fn snapshot(&self) -> Vec<StreamStatus> {
        self.streams.read().await.values().cloned().collect()
    }
}
