//! Watermark-driven ingestion for one stream.
//!
//! An [`IngestCursor`] repeatedly reads the stream's persisted watermark,
//! asks the source for observations between the watermark and a horizon
//! that trails the wall clock by a safety lag, reconciles every observation,
//! and only then moves the watermark forward.
//!
//! # State machine
//!
//! ```text
//! Idle -> Fetching -> Draining -> Checkpointing -> Idle
//!            |                                      ^
//!            +-> Backoff ---------------------------+
//! ```
//!
//! Capped pages are paginated by moving the lower bound to the latest start
//! seen; a page that does not advance at all is force-advanced by a fixed
//! tick so the loop always terminates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use geode_types::{KindTable, normalize};

use crate::reconcile::{ReconcileError, Reconciler};
use crate::source::{ObservationSource, SearchPage, SourceError, StreamQuery};
use crate::status::{CursorState, StatusBoard, StreamStats};
use crate::store::{SessionStore, StoreError};
use crate::watermark::WatermarkStore;

/// Default width of one query window (seconds).
pub const DEFAULT_WINDOW_SECS: i64 = 300;

/// Default distance the horizon trails the wall clock (seconds).
pub const DEFAULT_SAFETY_LAG_SECS: i64 = 300;

/// Default look-back for a stream with no watermark (seconds).
pub const DEFAULT_INITIAL_LOOKBACK_SECS: i64 = 300;

/// Default forced advance for a page that made no progress (seconds).
pub const DEFAULT_FORCE_ADVANCE_SECS: i64 = 1;

/// Default delay before retrying a failed page (seconds).
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Default delay between polls once caught up (seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Timing parameters of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorConfig {
    /// Maximum width of one query window.
    pub window: TimeDelta,
    /// How far the horizon trails the wall clock.
    pub safety_lag: TimeDelta,
    /// Where a stream without a watermark starts, behind the horizon.
    pub initial_lookback: TimeDelta,
    /// Advance applied when a capped page made no progress.
    pub force_advance: TimeDelta,
    /// Delay before retrying after a failure.
    pub retry_delay: Duration,
    /// Delay between polls once the stream is caught up.
    pub poll_interval: Duration,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            window: TimeDelta::seconds(DEFAULT_WINDOW_SECS),
            safety_lag: TimeDelta::seconds(DEFAULT_SAFETY_LAG_SECS),
            initial_lookback: TimeDelta::seconds(DEFAULT_INITIAL_LOOKBACK_SECS),
            force_advance: TimeDelta::seconds(DEFAULT_FORCE_ADVANCE_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

/// Errors that end one poll of a cursor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    /// The source query failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Reconciling an observation hit a store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reading or writing the watermark failed.
    #[error("watermark store failed: {0}")]
    Watermark(StoreError),

    /// Time arithmetic or stored intervals are inconsistent.
    #[error("inconsistent time comparison: {detail}")]
    TimeComparisonInconsistent {
        /// What went wrong.
        detail: String,
    },
}

impl CursorError {
    /// Whether the stream must stop instead of backing off.
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::TimeComparisonInconsistent { .. } => true,
            Self::Store(err) | Self::Watermark(err) => !err.is_transient(),
            Self::Source(_) => false,
        }
    }

    fn time(detail: &str) -> Self {
        Self::TimeComparisonInconsistent {
            detail: detail.to_owned(),
        }
    }
}

/// Result of one successful poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The watermark is already at the horizon.
    Idle,
    /// The watermark moved from `from` to `to`.
    Advanced {
        /// Watermark before the poll.
        from: DateTime<Utc>,
        /// Watermark after the poll.
        to: DateTime<Utc>,
        /// Pages fetched.
        pages: u64,
        /// Raw observations received.
        observations: u64,
        /// Whether `to` reached the safety horizon.
        caught_up: bool,
    },
}

/// Drives one stream from the source into the store.
#[derive(Debug)]
pub struct IngestCursor<Src, St, W> {
    query: StreamQuery,
    source: Src,
    reconciler: Reconciler<St>,
    watermarks: W,
    kinds: Arc<KindTable>,
    config: CursorConfig,
    board: StatusBoard,
}

impl<Src, St, W> IngestCursor<Src, St, W>
where
    Src: ObservationSource,
    St: SessionStore,
    W: WatermarkStore,
{
    /// Create a cursor for `query` that publishes to a private board.
    pub fn new(
        query: StreamQuery,
        source: Src,
        reconciler: Reconciler<St>,
        watermarks: W,
        kinds: Arc<KindTable>,
    ) -> Self {
        Self {
            query,
            source,
            reconciler,
            watermarks,
            kinds,
            config: CursorConfig::default(),
            board: StatusBoard::new(),
        }
    }

    /// Use `config` instead of the default timings.
    #[must_use]
    pub const fn with_config(mut self, config: CursorConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish status to a shared board.
    #[must_use]
    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.board = board;
        self
    }

    /// The stream this cursor drives.
    pub fn stream(&self) -> &str {
        &self.query.stream
    }

    async fn set_state(&self, state: CursorState) {
        self.board
            .update(&self.query.stream, |status| status.state = state)
            .await;
    }

    async fn checkpoint(&self, watermark: DateTime<Utc>) -> Result<(), CursorError> {
        self.set_state(CursorState::Checkpointing).await;
        self.watermarks
            .set(&self.query.stream, watermark)
            .await
            .map_err(CursorError::Watermark)?;

        tracing::info!(stream = %self.query.stream, %watermark, "Checkpointed watermark");
        self.board
            .update(&self.query.stream, |status| {
                status.watermark = Some(watermark);
                status.last_checkpoint_at = Some(Utc::now());
                status.last_error = None;
            })
            .await;
        Ok(())
    }

    /// Reconcile one page in order, advancing `candidate` to the latest
    /// start seen. Malformed and unidentifiable observations are dropped.
    async fn drain(
        &self,
        page: &SearchPage,
        candidate: &mut DateTime<Utc>,
        stats: &mut StreamStats,
    ) -> Result<(), CursorError> {
        for raw in &page.observations {
            stats.observations = stats.observations.saturating_add(1);

            let record = match normalize(raw, &self.kinds) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(stream = %self.query.stream, error = %err, "Dropping malformed observation");
                    stats.record_dropped();
                    continue;
                }
            };
            *candidate = (*candidate).max(record.start());

            match self.reconciler.apply(&record).await {
                Ok(outcome) => stats.record(&outcome),
                Err(ReconcileError::AmbiguousIdentity) => {
                    tracing::warn!(
                        stream = %self.query.stream,
                        start = %record.start(),
                        "Dropping observation with no mac or ip"
                    );
                    stats.record_dropped();
                }
                Err(ReconcileError::Store(err)) => return Err(CursorError::Store(err)),
                Err(ReconcileError::TimeComparisonInconsistent { detail }) => {
                    return Err(CursorError::TimeComparisonInconsistent { detail });
                }
            }
        }
        Ok(())
    }

    /// Run one fetch/drain/checkpoint cycle against the horizon implied by
    /// `now`.
    ///
    /// The watermark is written after every capped page (to the next lower
    /// bound) and at the end of the window. On any error it stays where the
    /// last successful checkpoint left it, so the failed page is re-read in
    /// full on the next poll.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Step, CursorError> {
        let stream = self.query.stream.as_str();
        let horizon = now
            .checked_sub_signed(self.config.safety_lag)
            .ok_or_else(|| CursorError::time("safety horizon out of range"))?;

        let from = match self
            .watermarks
            .get(stream)
            .await
            .map_err(CursorError::Watermark)?
        {
            Some(watermark) => watermark,
            None => horizon
                .checked_sub_signed(self.config.initial_lookback)
                .ok_or_else(|| CursorError::time("initial look-back out of range"))?,
        };
        let to = from
            .checked_add_signed(self.config.window)
            .ok_or_else(|| CursorError::time("query window out of range"))?
            .min(horizon);

        if to <= from {
            self.set_state(CursorState::Idle).await;
            return Ok(Step::Idle);
        }

        let mut lower = from;
        let mut stats = StreamStats::default();
        loop {
            self.set_state(CursorState::Fetching).await;
            let page = self.source.search(&self.query, lower, to).await?;
            tracing::debug!(
                stream,
                earliest = %lower,
                latest = %to,
                observations = page.observations.len(),
                capped = page.capped,
                "Fetched page"
            );

            self.set_state(CursorState::Draining).await;
            let mut candidate = lower;
            // A failed page is re-read in full, so it is only counted once
            // it drains.
            let mut page_stats = StreamStats {
                pages: 1,
                ..StreamStats::default()
            };
            self.drain(&page, &mut candidate, &mut page_stats).await?;
            stats.absorb(&page_stats);
            self.board
                .update(stream, |status| status.stats.absorb(&page_stats))
                .await;

            if !page.capped {
                break;
            }

            let next = if candidate > lower {
                candidate
            } else {
                let forced = lower
                    .checked_add_signed(self.config.force_advance)
                    .ok_or_else(|| CursorError::time("forced advance out of range"))?;
                tracing::warn!(stream, from = %lower, to = %forced, "Capped page made no progress, forcing advance");
                forced
            };
            if next >= to {
                break;
            }
            self.checkpoint(next).await?;
            lower = next;
        }

        self.checkpoint(to).await?;
        self.set_state(CursorState::Idle).await;

        Ok(Step::Advanced {
            from,
            to,
            pages: stats.pages,
            observations: stats.observations,
            caught_up: to == horizon,
        })
    }

    /// Poll forever: immediately while backfilling, every `poll_interval`
    /// once caught up, after `retry_delay` on a recoverable failure.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`CursorError`]; the stream is marked halted.
    pub async fn run(&self) -> Result<(), CursorError> {
        let stream = self.query.stream.as_str();
        self.board
            .register(stream, self.reconciler.policy().kind)
            .await;
        tracing::info!(stream, policy = %self.reconciler.policy().kind, "Stream worker started");

        loop {
            match self.poll_once(Utc::now()).await {
                Ok(Step::Idle) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(Step::Advanced {
                    from,
                    to,
                    pages,
                    observations,
                    caught_up,
                }) => {
                    tracing::info!(stream, %from, %to, pages, observations, "Window ingested");
                    if caught_up {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(stream, error = %err, "Stream halted");
                    let message = err.to_string();
                    self.board
                        .update(stream, |status| {
                            status.state = CursorState::Halted;
                            status.last_error = Some(message);
                        })
                        .await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        stream,
                        error = %err,
                        retry_in_secs = self.config.retry_delay.as_secs(),
                        "Page failed, backing off"
                    );
                    let message = err.to_string();
                    self.board
                        .update(stream, |status| {
                            status.state = CursorState::Backoff;
                            status.last_error = Some(message);
                            status.stats.failures = status.stats.failures.saturating_add(1);
                        })
                        .await;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}
