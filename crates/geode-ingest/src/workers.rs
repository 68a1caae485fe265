//! One tokio task per configured stream.
//!
//! Every worker owns an [`IngestCursor`] but shares the governed source,
//! the session store, the watermark store, the identity locks, and the
//! status board with its siblings. A worker only ever returns on a fatal
//! error; the others keep running.

use std::sync::Arc;

use geode_core::config::GeodeConfig;
use geode_core::cursor::IngestCursor;
use geode_core::locks::IdentityLocks;
use geode_core::reconcile::Reconciler;
use geode_core::source::ObservationSource;
use geode_core::status::StatusBoard;
use geode_core::store::SessionStore;
use geode_core::watermark::WatermarkStore;
use geode_types::KindTable;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::IngestError;

/// Handles of the running stream workers.
pub type Workers = JoinSet<Result<(), IngestError>>;

/// Build a cursor for every configured stream and spawn it.
///
/// All policies are built before anything is spawned, so a bad stream
/// definition starts nothing.
///
/// # Errors
///
/// Returns [`IngestError::Config`] if a stream's policy cannot be built.
pub fn spawn_streams<Src, St, W>(
    config: &GeodeConfig,
    source: &Arc<Src>,
    store: &Arc<St>,
    watermarks: &Arc<W>,
    kinds: &Arc<KindTable>,
    board: &StatusBoard,
) -> Result<Workers, IngestError>
where
    Src: ObservationSource + 'static,
    St: SessionStore + 'static,
    W: WatermarkStore + 'static,
{
    let locks = Arc::new(IdentityLocks::new());
    let cursor_config = config.ingest.cursor_config();

    let cursors = config
        .streams
        .iter()
        .map(|stream| {
            let reconciler = Reconciler::new(Arc::clone(store), stream.to_policy(kinds)?)
                .with_locks(Arc::clone(&locks));
            Ok(IngestCursor::new(
                stream.query(),
                Arc::clone(source),
                reconciler,
                Arc::clone(watermarks),
                Arc::clone(kinds),
            )
            .with_config(cursor_config)
            .with_status_board(board.clone()))
        })
        .collect::<Result<Vec<_>, IngestError>>()?;

    let mut workers = JoinSet::new();
    for cursor in cursors {
        workers.spawn(async move {
            cursor.run().await.map_err(|source| IngestError::Stream {
                stream: cursor.stream().to_owned(),
                source,
            })
        });
    }

    info!(streams = workers.len(), "Stream workers spawned");
    Ok(workers)
}

/// Wait for workers to finish, logging each exit. Returns how many
/// stopped on an error.
pub async fn supervise(workers: &mut Workers) -> usize {
    let mut failed: usize = 0;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => info!("Stream worker finished"),
            Ok(Err(err)) => {
                error!(error = %err, remaining = workers.len(), "Stream worker stopped");
                failed = failed.saturating_add(1);
            }
            Err(err) => {
                warn!(error = %err, remaining = workers.len(), "Stream worker aborted");
                failed = failed.saturating_add(1);
            }
        }
    }
    failed
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use geode_core::memory::{MemoryStore, MemoryWatermarks};
    use geode_core::source::{SearchPage, SourceError, StreamQuery};
    use geode_core::status::CursorState;

    use super::*;

    /// Always answers with an empty, uncapped page.
    struct QuietSource;

    impl ObservationSource for QuietSource {
        async fn search(
            &self,
            _query: &StreamQuery,
            _earliest: DateTime<Utc>,
            _latest: DateTime<Utc>,
        ) -> Result<SearchPage, SourceError> {
            Ok(SearchPage::default())
        }
    }

    const TWO_STREAMS: &str = r"
streams:
  - name: dhcp
    search: index=dhcp DHCPACK
    policy: lease
  - name: tomcat
    search: index=tomcat
    policy: info
    latency_kinds: [tomcat]
";

    #[tokio::test(start_paused = true)]
    async fn every_stream_gets_a_worker() {
        let config = GeodeConfig::parse(TWO_STREAMS).unwrap();
        let kinds = Arc::new(config.kind_table().unwrap());
        let board = StatusBoard::new();
        let marks = Arc::new(MemoryWatermarks::new());

        let mut workers = spawn_streams(
            &config,
            &Arc::new(QuietSource),
            &Arc::new(MemoryStore::new()),
            &marks,
            &kinds,
            &board,
        )
        .unwrap();
        assert_eq!(workers.len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let streams = board.snapshot().await;
        assert_eq!(streams.len(), 2);
        for status in streams {
            assert_eq!(status.state, CursorState::Idle);
            assert!(marks.peek(&status.name).is_some());
        }

        workers.abort_all();
        assert_eq!(supervise(&mut workers).await, 2);
    }

    #[test]
    fn bad_streams_spawn_nothing() {
        let mut config = GeodeConfig::parse(TWO_STREAMS).unwrap();
        config.streams[1].latency_kinds = vec!["radius".to_owned()];

        let result = spawn_streams(
            &config,
            &Arc::new(QuietSource),
            &Arc::new(MemoryStore::new()),
            &Arc::new(MemoryWatermarks::new()),
            &Arc::new(KindTable::default()),
            &StatusBoard::new(),
        );
        assert!(matches!(result, Err(IngestError::Config { .. })));
    }
}
