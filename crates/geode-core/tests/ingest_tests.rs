//! Integration tests for the ingestion cursor.
//!
//! A scripted source replays canned pages (or failures) and records every
//! window it was asked for; sessions and watermarks live in the in-memory
//! stores so every effect can be inspected after a poll. Concurrency tests
//! wrap the memory store in one that yields after each lookup.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use geode_core::cursor::{CursorError, IngestCursor, Step};
use geode_core::locks::IdentityLocks;
use geode_core::memory::{MemoryStore, MemoryWatermarks};
use geode_core::policy::{DEFAULT_INFO_KEYS, StreamPolicy};
use geode_core::reconcile::{Outcome, Reconciler};
use geode_core::source::{ObservationSource, SearchPage, SourceError, StreamQuery};
use geode_core::status::{CursorState, StatusBoard};
use geode_core::store::{FieldPatch, OverlapQuery, SessionStore, StoreError};
use geode_core::watermark::WatermarkStore;
use geode_types::{
    AttributeKey, EventKind, EventRecord, Interval, KindTable, RawObservation, RawValue,
    SessionId,
};

type Cursor = IngestCursor<Arc<ScriptedSource>, Arc<MemoryStore>, Arc<MemoryWatermarks>>;

/// Replays scripted results in order, then empty uncapped pages.
#[derive(Default)]
struct ScriptedSource {
    script: Mutex<VecDeque<Result<SearchPage, SourceError>>>,
    requests: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl ScriptedSource {
    fn with(results: Vec<Result<SearchPage, SourceError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.requests.lock().unwrap().clone()
    }
}

impl ObservationSource for ScriptedSource {
    async fn search(
        &self,
        _query: &StreamQuery,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<SearchPage, SourceError> {
        self.requests.lock().unwrap().push((earliest, latest));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SearchPage::default()))
    }
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 11, 22, hour, minute, second)
        .unwrap()
}

fn noon() -> DateTime<Utc> {
    at(12, 0, 0)
}

/// A lease observation for the device whose mac ends in `device`.
fn observation(device: &str, start: DateTime<Utc>) -> RawObservation {
    [
        ("mac".to_owned(), RawValue::from(format!("02:00:00:00:00:{device}"))),
        ("start".to_owned(), RawValue::Timestamp(start)),
        ("event_type".to_owned(), RawValue::from("DHCPACK")),
    ]
    .into_iter()
    .collect()
}

fn page(observations: Vec<RawObservation>, capped: bool) -> Result<SearchPage, SourceError> {
    Ok(SearchPage {
        observations,
        capped,
    })
}

fn cursor(
    name: &str,
    source: &Arc<ScriptedSource>,
    store: &Arc<MemoryStore>,
    marks: &Arc<MemoryWatermarks>,
) -> Cursor {
    let query = StreamQuery {
        stream: name.to_owned(),
        search: format!("search index={name}"),
    };
    IngestCursor::new(
        query,
        Arc::clone(source),
        Reconciler::new(Arc::clone(store), StreamPolicy::default()),
        Arc::clone(marks),
        Arc::new(KindTable::default()),
    )
}

#[tokio::test]
async fn first_poll_starts_behind_the_horizon() {
    let source = ScriptedSource::with(vec![]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());

    let step = cursor("dhcp", &source, &store, &marks)
        .poll_once(noon())
        .await
        .unwrap();

    assert_eq!(
        step,
        Step::Advanced {
            from: at(11, 50, 0),
            to: at(11, 55, 0),
            pages: 1,
            observations: 0,
            caught_up: true,
        }
    );
    assert_eq!(source.requests(), vec![(at(11, 50, 0), at(11, 55, 0))]);
    assert_eq!(marks.peek("dhcp"), Some(at(11, 55, 0)));
}

#[tokio::test]
async fn caught_up_stream_is_idle() {
    let source = ScriptedSource::with(vec![]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let cursor = cursor("dhcp", &source, &store, &marks);

    cursor.poll_once(noon()).await.unwrap();
    assert_eq!(cursor.poll_once(noon()).await.unwrap(), Step::Idle);
    assert_eq!(source.requests().len(), 1);
}

#[tokio::test]
async fn backfill_is_bounded_by_the_window() {
    let source = ScriptedSource::with(vec![]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let cursor = cursor("dhcp", &source, &store, &marks);

    marks.set("dhcp", at(11, 0, 0)).await.unwrap();
    let step = cursor.poll_once(noon()).await.unwrap();
    assert!(matches!(step, Step::Advanced { caught_up: false, .. }));
    cursor.poll_once(noon()).await.unwrap();

    assert_eq!(
        source.requests(),
        vec![
            (at(11, 0, 0), at(11, 5, 0)),
            (at(11, 5, 0), at(11, 10, 0)),
        ]
    );
    assert_eq!(marks.peek("dhcp"), Some(at(11, 10, 0)));
}

#[tokio::test]
async fn capped_pages_paginate_from_the_last_start() {
    let source = ScriptedSource::with(vec![
        page(
            vec![
                observation("aa", at(11, 50, 0)),
                observation("bb", at(11, 51, 0)),
            ],
            true,
        ),
        page(
            vec![
                observation("bb", at(11, 51, 0)),
                observation("cc", at(11, 52, 0)),
            ],
            false,
        ),
    ]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());

    let step = cursor("dhcp", &source, &store, &marks)
        .poll_once(noon())
        .await
        .unwrap();

    assert!(matches!(
        step,
        Step::Advanced {
            pages: 2,
            observations: 4,
            ..
        }
    ));
    assert_eq!(
        source.requests(),
        vec![
            (at(11, 50, 0), at(11, 55, 0)),
            (at(11, 51, 0), at(11, 55, 0)),
        ]
    );
    // The re-delivered observation merged into its own session.
    assert_eq!(store.len(), 3);
    assert_eq!(marks.peek("dhcp"), Some(at(11, 55, 0)));
}

#[tokio::test]
async fn capped_page_checkpoint_survives_a_later_failure() {
    let source = ScriptedSource::with(vec![
        page(
            vec![
                observation("aa", at(11, 50, 0)),
                observation("bb", at(11, 53, 0)),
            ],
            true,
        ),
        Err(SourceError::Unavailable("connection refused".to_owned())),
    ]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());

    let result = cursor("dhcp", &source, &store, &marks)
        .poll_once(noon())
        .await;

    assert!(matches!(result, Err(CursorError::Source(_))));
    assert_eq!(marks.peek("dhcp"), Some(at(11, 53, 0)));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn page_without_progress_is_force_advanced() {
    let source = ScriptedSource::with(vec![page(
        vec![
            observation("aa", at(11, 50, 0)),
            observation("bb", at(11, 50, 0)),
        ],
        true,
    )]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());

    cursor("dhcp", &source, &store, &marks)
        .poll_once(noon())
        .await
        .unwrap();

    let requests = source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].0, at(11, 50, 1));
    assert_eq!(marks.peek("dhcp"), Some(at(11, 55, 0)));
}

#[tokio::test]
async fn store_failure_leaves_the_watermark_alone() {
    let batch = vec![observation("aa", at(11, 50, 0))];
    let source = ScriptedSource::with(vec![page(batch.clone(), false), page(batch, false)]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let cursor = cursor("dhcp", &source, &store, &marks);

    store.fail_writes(1);
    let failed = cursor.poll_once(noon()).await;
    assert!(matches!(
        failed,
        Err(CursorError::Store(StoreError::Unavailable(_)))
    ));
    assert!(!failed.unwrap_err().is_fatal());
    assert_eq!(marks.peek("dhcp"), None);
    assert!(store.is_empty());

    cursor.poll_once(noon()).await.unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(
        source.requests(),
        vec![
            (at(11, 50, 0), at(11, 55, 0)),
            (at(11, 50, 0), at(11, 55, 0)),
        ]
    );
    assert_eq!(marks.peek("dhcp"), Some(at(11, 55, 0)));
}

#[tokio::test]
async fn retried_page_is_counted_once() {
    let batch = vec![
        observation("aa", at(11, 50, 0)),
        observation("bb", at(11, 51, 0)),
    ];
    let source = ScriptedSource::with(vec![page(batch.clone(), false), page(batch, false)]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let board = StatusBoard::new();
    board.register("dhcp", StreamPolicy::default().kind).await;
    let cursor = cursor("dhcp", &source, &store, &marks).with_status_board(board.clone());

    // The first observation is already stored and reconciles without a
    // write; inserting the second one fails.
    store
        .seed(
            EventRecord::new(Interval::instant(at(11, 50, 0)).unwrap())
                .with(AttributeKey::Mac, "02:00:00:00:00:aa")
                .with_kind(EventKind::new("DHCPACK")),
        )
        .unwrap();
    store.fail_writes(1);
    assert!(cursor.poll_once(noon()).await.is_err());
    let status = board.get("dhcp").await.unwrap();
    assert_eq!(status.stats.pages, 0);
    assert_eq!(status.stats.observations, 0);
    assert_eq!(status.stats.unchanged, 0);

    cursor.poll_once(noon()).await.unwrap();
    let status = board.get("dhcp").await.unwrap();
    assert_eq!(status.stats.pages, 1);
    assert_eq!(status.stats.observations, 2);
    assert_eq!(status.stats.unchanged, 1);
    assert_eq!(status.stats.inserted, 1);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn watermark_failure_is_retried_with_the_same_window() {
    let source = ScriptedSource::with(vec![page(vec![observation("aa", at(11, 50, 0))], false)]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let cursor = cursor("dhcp", &source, &store, &marks);

    marks.fail_writes(1);
    assert!(matches!(
        cursor.poll_once(noon()).await,
        Err(CursorError::Watermark(_))
    ));
    cursor.poll_once(noon()).await.unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(marks.peek("dhcp"), Some(at(11, 55, 0)));
}

#[tokio::test]
async fn malformed_and_anonymous_observations_are_dropped() {
    let no_start: RawObservation = [("mac".to_owned(), RawValue::from("aa"))]
        .into_iter()
        .collect();
    let no_identity: RawObservation = [
        ("start".to_owned(), RawValue::Timestamp(at(11, 51, 0))),
        ("netid".to_owned(), RawValue::from("jdoe")),
    ]
    .into_iter()
    .collect();
    let source = ScriptedSource::with(vec![page(
        vec![no_start, no_identity, observation("aa", at(11, 52, 0))],
        false,
    )]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let board = StatusBoard::new();
    board.register("dhcp", StreamPolicy::default().kind).await;

    cursor("dhcp", &source, &store, &marks)
        .with_status_board(board.clone())
        .poll_once(noon())
        .await
        .unwrap();

    assert_eq!(store.len(), 1);
    let status = board.get("dhcp").await.unwrap();
    assert_eq!(status.stats.dropped, 2);
    assert_eq!(status.stats.inserted, 1);
    assert_eq!(status.stats.observations, 3);
    assert_eq!(status.watermark, Some(at(11, 55, 0)));
    assert_eq!(status.state, CursorState::Idle);
}

/// Hands control back to the scheduler after every lookup, so reconcilers
/// joined on one task interleave between their read and their write.
struct YieldingStore(Arc<MemoryStore>);

impl SessionStore for YieldingStore {
    async fn find_overlapping(
        &self,
        query: &OverlapQuery,
    ) -> Result<Option<EventRecord>, StoreError> {
        let found = self.0.find_overlapping(query).await;
        tokio::task::yield_now().await;
        found
    }

    async fn insert(&self, record: &EventRecord) -> Result<SessionId, StoreError> {
        self.0.insert(record).await
    }

    async fn overwrite(&self, id: SessionId, record: &EventRecord) -> Result<(), StoreError> {
        self.0.overwrite(id, record).await
    }

    async fn patch_fields(&self, id: SessionId, patch: &FieldPatch) -> Result<(), StoreError> {
        self.0.patch_fields(id, patch).await
    }

    async fn terminate_and_insert(
        &self,
        id: SessionId,
        stop: DateTime<Utc>,
        successor: &EventRecord,
    ) -> Result<SessionId, StoreError> {
        self.0.terminate_and_insert(id, stop, successor).await
    }
}

#[tokio::test]
async fn streams_sharing_an_identity_insert_once() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(YieldingStore(Arc::clone(&memory)));
    let marks = Arc::new(MemoryWatermarks::new());
    let locks = Arc::new(IdentityLocks::new());
    let kinds = Arc::new(KindTable::default());

    let make = |name: &str| {
        let source = ScriptedSource::with(vec![page(
            vec![observation("aa", at(11, 50, 0))],
            false,
        )]);
        IngestCursor::new(
            StreamQuery {
                stream: name.to_owned(),
                search: String::new(),
            },
            source,
            Reconciler::new(Arc::clone(&store), StreamPolicy::default())
                .with_locks(Arc::clone(&locks)),
            Arc::clone(&marks),
            Arc::clone(&kinds),
        )
    };
    let (left, right) = (make("left"), make("right"));

    let (a, b) = tokio::join!(left.poll_once(noon()), right.poll_once(noon()));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(memory.len(), 1);
}

#[tokio::test]
async fn streams_keyed_by_different_columns_keep_each_others_writes() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(YieldingStore(Arc::clone(&memory)));
    let locks = Arc::new(IdentityLocks::new());
    let mac = "02:00:00:00:00:aa";

    let id = memory
        .seed(
            EventRecord::new(Interval::new(at(10, 0, 0), at(11, 0, 0)).unwrap())
                .with(AttributeKey::Mac, mac)
                .with(AttributeKey::Ip, "10.1.1.1"),
        )
        .unwrap();

    // Web access is keyed by ip, wireless authentication by mac.
    let web = Reconciler::new(Arc::clone(&store), StreamPolicy::generic(TimeDelta::seconds(30)))
        .with_locks(Arc::clone(&locks));
    let wireless = Reconciler::new(
        Arc::clone(&store),
        StreamPolicy::info(TimeDelta::minutes(10), BTreeSet::new(), DEFAULT_INFO_KEYS.to_vec()),
    )
    .with_locks(Arc::clone(&locks));

    let request = EventRecord::new(Interval::new(at(10, 20, 0), at(11, 30, 0)).unwrap())
        .with(AttributeKey::Ip, "10.1.1.1")
        .with(AttributeKey::UserAgent, "firefox");
    let login = EventRecord::new(Interval::instant(at(10, 15, 0)).unwrap())
        .with(AttributeKey::Mac, mac)
        .with(AttributeKey::Netid, "jdoe");

    let (merged, patched) = tokio::join!(web.apply(&request), wireless.apply(&login));
    assert_eq!(merged.unwrap(), Outcome::Merged(id));
    assert_eq!(patched.unwrap(), Outcome::Patched(id));

    assert_eq!(memory.len(), 1);
    let row = memory.get(id).unwrap();
    assert_eq!(row.get(AttributeKey::Netid), Some("jdoe"));
    assert_eq!(row.get(AttributeKey::UserAgent), Some("firefox"));
    assert_eq!(row.stop(), at(11, 30, 0));
}

#[tokio::test(start_paused = true)]
async fn source_outage_backs_off_and_recovers() {
    let source = ScriptedSource::with(vec![Err(SourceError::Unavailable(
        "connection refused".to_owned(),
    ))]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let board = StatusBoard::new();
    let cursor = Arc::new(cursor("dhcp", &source, &store, &marks).with_status_board(board.clone()));

    let worker = {
        let cursor = Arc::clone(&cursor);
        tokio::spawn(async move { cursor.run().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = board.get("dhcp").await.unwrap();
    assert_eq!(status.state, CursorState::Backoff);
    assert_eq!(status.stats.failures, 1);
    assert!(status.last_error.is_some());
    assert_eq!(marks.peek("dhcp"), None);

    // Retry fires at 61s; the caught-up poll then sleeps until 121s.
    tokio::time::sleep(Duration::from_secs(90)).await;
    let status = board.get("dhcp").await.unwrap();
    assert_eq!(status.state, CursorState::Idle);
    assert!(status.last_error.is_none());
    assert!(status.watermark.is_some());

    worker.abort();
}

#[tokio::test]
async fn inconsistent_time_halts_the_stream() {
    let end = DateTime::<Utc>::MAX_UTC;
    let edge: RawObservation = [
        ("mac".to_owned(), RawValue::from("02:00:00:00:00:aa")),
        (
            "start".to_owned(),
            RawValue::Timestamp(end - TimeDelta::seconds(10)),
        ),
        ("stop".to_owned(), RawValue::Timestamp(end)),
    ]
    .into_iter()
    .collect();
    let source = ScriptedSource::with(vec![page(vec![edge], false)]);
    let store = Arc::new(MemoryStore::new());
    let marks = Arc::new(MemoryWatermarks::new());
    let board = StatusBoard::new();

    let result = cursor("dhcp", &source, &store, &marks)
        .with_status_board(board.clone())
        .run()
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, CursorError::TimeComparisonInconsistent { .. }));
    assert!(err.is_fatal());
    assert_eq!(
        board.get("dhcp").await.map(|status| status.state),
        Some(CursorState::Halted)
    );
    assert_eq!(marks.peek("dhcp"), None);
}
