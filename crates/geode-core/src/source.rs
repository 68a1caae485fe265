//! The telemetry source abstraction and its rate governor.
//!
//! An [`ObservationSource`] answers time-bounded searches for one stream with
//! a page of raw observations, flagging pages that hit the source's result
//! cap. [`GovernedSource`] wraps any source with a shared concurrency ceiling
//! and a per-query timeout, and counts in-flight queries.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use geode_types::RawObservation;
use tokio::sync::Semaphore;

/// Default ceiling on concurrent source queries.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Default timeout for one source query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(120);

/// The search a stream runs against the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamQuery {
    /// Stream name.
    pub stream: String,
    /// Source-specific search text.
    pub search: String,
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// Observations in ascending start order.
    pub observations: Vec<RawObservation>,
    /// Whether the source truncated the result at its page limit.
    pub capped: bool,
}

/// Errors surfaced by an [`ObservationSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The source could not be reached or failed the request.
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),

    /// The query did not finish within the configured timeout.
    #[error("telemetry query timed out after {0:?}")]
    Timeout(Duration),

    /// The source answered with something that could not be interpreted.
    #[error("telemetry source rejected the query: {0}")]
    Rejected(String),
}

/// A query-based telemetry source.
pub trait ObservationSource: Send + Sync {
    /// Search `query` over `[earliest, latest)`.
    fn search(
        &self,
        query: &StreamQuery,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> impl Future<Output = Result<SearchPage, SourceError>> + Send;
}

impl<T: ObservationSource> ObservationSource for Arc<T> {
    fn search(
        &self,
        query: &StreamQuery,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> impl Future<Output = Result<SearchPage, SourceError>> + Send {
        (**self).search(query, earliest, latest)
    }
}

/// Decrements the outstanding counter when a query ends, however it ends.
struct Outstanding<'a>(&'a AtomicUsize);

impl<'a> Outstanding<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A source shared by every stream with a concurrency ceiling and timeout.
#[derive(Debug)]
pub struct GovernedSource<S> {
    inner: S,
    permits: Semaphore,
    timeout: Duration,
    outstanding: AtomicUsize,
}

impl<S: ObservationSource> GovernedSource<S> {
    /// Wrap `inner` with the default ceiling and timeout.
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            permits: Semaphore::const_new(DEFAULT_MAX_CONCURRENT_JOBS),
            timeout: DEFAULT_QUERY_TIMEOUT,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Set the maximum number of concurrent queries (at least one).
    #[must_use]
    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.permits = Semaphore::new(jobs.max(1));
        self
    }

    /// Set the per-query timeout.
    #[must_use]
    pub const fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of queries currently submitted to the inner source.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Number of queries that could start right now.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// The wrapped source.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ObservationSource> ObservationSource for GovernedSource<S> {
    async fn search(
        &self,
        query: &StreamQuery,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<SearchPage, SourceError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|closed| SourceError::Unavailable(format!("source governor: {closed}")))?;
        let _outstanding = Outstanding::enter(&self.outstanding);

        tracing::debug!(
            stream = %query.stream,
            %earliest,
            %latest,
            outstanding = self.outstanding(),
            "Submitting source query"
        );

        tokio::time::timeout(self.timeout, self.inner.search(query, earliest, latest))
            .await
            .map_err(|_elapsed| SourceError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Sleeps for a fixed delay and records the peak concurrency it saw.
    struct SlowSource {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ObservationSource for SlowSource {
        async fn search(
            &self,
            _query: &StreamQuery,
            _earliest: DateTime<Utc>,
            _latest: DateTime<Utc>,
        ) -> Result<SearchPage, SourceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(SearchPage::default())
        }
    }

    fn slow(delay: Duration) -> SlowSource {
        SlowSource {
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn query() -> StreamQuery {
        StreamQuery {
            stream: "dhcp".to_owned(),
            search: "search index=dhcp".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queries_past_the_timeout_fail() {
        let source = GovernedSource::new(slow(Duration::from_secs(300)))
            .with_query_timeout(Duration::from_secs(5));
        let now = Utc::now();
        let result = source.search(&query(), now, now).await;
        assert_eq!(result, Err(SourceError::Timeout(Duration::from_secs(5))));
        assert_eq!(source.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let source = Arc::new(
            GovernedSource::new(slow(Duration::from_secs(1))).with_max_concurrent_jobs(2),
        );
        let now = Utc::now();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let source = Arc::clone(&source);
            tasks.spawn(async move { source.search(&query(), now, now).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(source.inner().peak.load(Ordering::SeqCst), 2);
        assert_eq!(source.outstanding(), 0);
        assert_eq!(source.available_slots(), 2);
    }
}
