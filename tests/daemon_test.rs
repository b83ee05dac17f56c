//! Projection daemon end to end: tailing, waiting, pausing, restarts, faults.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_daemon_config, open_temp_store, Arrival, Travel, TripStarted};
use spitefold::flattened::{CompiledFlatTable, Table};
use spitefold::projection::{ApplyContext, ShardDefinition};
use spitefold::storage::ProjectionOp;
use spitefold::{
    AppendCommand, ColumnType, DaemonConfig, Error, Event, EventFilter, EventStore, FlatTableProjection, Projection,
    ProjectionDaemon, ShardName, ShardState, StoreConfig, StreamRev,
};

const WAIT: Duration = Duration::from_secs(10);

fn distance_projection() -> CompiledFlatTable {
    FlatTableProjection::new("Distance", "distance", "id", ColumnType::Text)
        .project::<Travel>(|map| {
            map.set("day", "day", ColumnType::Integer)
                .set("total", "distance", ColumnType::Real)
                .increment("legs");
        })
        .compile()
        .unwrap()
}

/// Appends a start, one travel and an arrival; returns (day, distance).
async fn append_journey(store: &EventStore, stream: &str, day: u32) -> (u32, f64) {
    let distance = 12.5 * day as f64;
    let events = vec![
        store.event_data(&TripStarted { day }).unwrap(),
        store.event_data(&Travel { day, distance }).unwrap(),
        store
            .event_data(&Arrival {
                day,
                state: "Texas".to_string(),
            })
            .unwrap(),
    ];
    store
        .append(AppendCommand::new(stream, StreamRev::NONE, events).with_stream_type("trip"))
        .await
        .unwrap();
    (day, distance)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_distance_rows_match_travel_events() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
    daemon.add_projection(distance_projection()).await.unwrap();
    daemon.start_all().await.unwrap();

    let mut expected = Vec::new();
    for i in 1..=10u32 {
        let stream = format!("trip-{i}");
        expected.push((stream.clone(), append_journey(&store, &stream, i).await));
    }

    // A stream that never travels.
    let idle = vec![
        store.event_data(&TripStarted { day: 1 }).unwrap(),
        store
            .event_data(&Arrival {
                day: 1,
                state: "Utah".to_string(),
            })
            .unwrap(),
    ];
    store
        .append(AppendCommand::new("stay-home", StreamRev::NONE, idle))
        .await
        .unwrap();

    let total_events = 10 * 3 + 2;
    let status = daemon
        .wait_for_shard_state("Distance:All", total_events, WAIT)
        .await
        .unwrap();
    assert_eq!(status.state, ShardState::Running);

    for (stream, (day, distance)) in &expected {
        let row = store
            .read_table_row("distance", "id", stream.clone())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no row for {stream}"));
        assert_eq!(row["day"].as_i64(), Some(*day as i64));
        assert_eq!(row["total"].as_f64(), Some(*distance));
        assert_eq!(row["legs"].as_i64(), Some(1));
    }

    let missing = store
        .read_table_row("distance", "id", "stay-home".to_string())
        .await
        .unwrap();
    assert!(missing.is_none());
    assert_eq!(store.query_table("distance", "id").await.unwrap().len(), 10);

    daemon.stop_all().await.unwrap();
    assert_eq!(daemon.shard_state("Distance:All").unwrap(), ShardState::Stopped);
    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shards_expose_names_and_filters() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(store.clone(), DaemonConfig::default());

    let per_type = FlatTableProjection::new("Legs", "legs", "id", ColumnType::Text)
        .project::<Travel>(|map| {
            map.increment("count");
        })
        .shard_by_stream_types(["car", "bike"])
        .compile()
        .unwrap();
    daemon.add_projection(per_type).await.unwrap();
    daemon.add_projection(distance_projection()).await.unwrap();

    let shards = daemon.shards();
    let names: Vec<String> = shards.iter().map(|s| s.name.to_string()).collect();
    assert_eq!(names, vec!["Distance:All", "Legs:bike", "Legs:car"]);
    assert_eq!(shards[1].filter.stream_types, Some(vec!["bike".to_string()]));
    assert_eq!(shards[0].filter.event_types, Some(vec!["travel".to_string()]));
    assert_eq!(daemon.projections(), vec!["Distance", "Legs"]);

    let duplicate = daemon.add_projection(distance_projection()).await.unwrap_err();
    assert!(matches!(duplicate, Error::Configuration(_)));

    assert!(matches!(daemon.shard_state("Nope:All"), Err(Error::ShardNotFound(_))));
    assert_eq!(daemon.tracker().all().len(), 3);

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_times_out_when_shard_is_behind() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
    daemon.add_projection(distance_projection()).await.unwrap();

    append_journey(&store, "trip-1", 1).await;

    // Registered but never started.
    let err = daemon
        .wait_for_shard_state("Distance:All", 3, Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        Error::Timeout { shard, target, reached } => {
            assert_eq!(shard, "Distance:All");
            assert_eq!(target, 3);
            assert_eq!(reached, 0);
        }
        other => panic!("expected timeout, got {other}"),
    }

    daemon.start_shard("Distance:All").await.unwrap();
    daemon.wait_for_non_stale_data(WAIT).await.unwrap();
    assert_eq!(daemon.shard_status("Distance:All").unwrap().last_seen, store.head_position());

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pause_and_resume() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
    daemon.add_projection(distance_projection()).await.unwrap();
    daemon.start_all().await.unwrap();

    append_journey(&store, "trip-1", 1).await;
    daemon.wait_for_shard_state("Distance:All", 3, WAIT).await.unwrap();

    daemon.pause_shard("Distance:All").unwrap();
    eventually(WAIT, Duration::from_millis(10), || {
        (daemon.shard_state("Distance:All").ok()? == ShardState::Paused).then_some(())
    })
    .await;

    append_journey(&store, "trip-2", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(daemon.shard_status("Distance:All").unwrap().last_seen.as_raw(), 3);
    assert!(store
        .read_table_row("distance", "id", "trip-2".to_string())
        .await
        .unwrap()
        .is_none());

    daemon.resume_shard("Distance:All").unwrap();
    daemon.wait_for_shard_state("Distance:All", 6, WAIT).await.unwrap();
    assert!(store
        .read_table_row("distance", "id", "trip-2".to_string())
        .await
        .unwrap()
        .is_some());

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_resumes_from_committed_progress() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;

    {
        let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
        daemon.add_projection(distance_projection()).await.unwrap();
        daemon.start_all().await.unwrap();
        for i in 1..=4u32 {
            append_journey(&store, &format!("trip-{i}"), i).await;
        }
        daemon.wait_for_shard_state("Distance:All", 12, WAIT).await.unwrap();
        daemon.kill_all();
    }

    // More travel on an existing stream while nothing runs.
    let more = vec![store.event_data(&Travel { day: 9, distance: 1.0 }).unwrap()];
    store
        .append(AppendCommand::new("trip-1", StreamRev::from_raw(3), more))
        .await
        .unwrap();

    let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
    daemon.add_projection(distance_projection()).await.unwrap();
    assert_eq!(daemon.shard_status("Distance:All").unwrap().last_seen.as_raw(), 12);

    daemon.start_all().await.unwrap();
    daemon.wait_for_shard_state("Distance:All", 13, WAIT).await.unwrap();

    // Counted exactly once per travel event across both daemons.
    let row = store
        .read_table_row("distance", "id", "trip-1".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["legs"].as_i64(), Some(2));
    assert_eq!(row["day"].as_i64(), Some(9));
    for i in 2..=4 {
        let row = store
            .read_table_row("distance", "id", format!("trip-{i}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["legs"].as_i64(), Some(1));
    }

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_projection_tables_are_tenant_scoped() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
    daemon.add_projection(distance_projection()).await.unwrap();
    daemon.start_all().await.unwrap();

    let acme = store.for_tenant("acme");
    append_journey(&store, "trip-1", 1).await;
    append_journey(&acme, "trip-1", 7).await;
    daemon.wait_for_shard_state("Distance:All", 6, WAIT).await.unwrap();

    let default_row = store
        .read_table_row("distance", "id", "trip-1".to_string())
        .await
        .unwrap()
        .unwrap();
    let acme_row = acme
        .read_table_row("distance", "id", "trip-1".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(default_row["day"].as_i64(), Some(1));
    assert_eq!(acme_row["day"].as_i64(), Some(7));

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}

// =============================================================================
// Faults
// =============================================================================

struct Exploding;

impl Projection for Exploding {
    fn name(&self) -> &str {
        "Exploding"
    }

    fn shards(&self) -> Vec<ShardDefinition> {
        vec![ShardDefinition {
            name: ShardName::all("Exploding"),
            filter: EventFilter::any(),
        }]
    }

    fn tables(&self) -> Vec<Table> {
        vec![Table::new("exploding", "id", ColumnType::Text)]
    }

    fn apply(&self, _ctx: &ApplyContext<'_>, _events: &[Event]) -> spitefold::Result<Vec<ProjectionOp>> {
        Err(Error::Configuration("cannot project this".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_failures_fault_the_shard() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(
        store.clone(),
        DaemonConfig {
            max_unexpected_failures: 2,
            ..fast_daemon_config()
        },
    );
    daemon.add_projection(Exploding).await.unwrap();
    daemon.add_projection(distance_projection()).await.unwrap();
    daemon.start_all().await.unwrap();

    append_journey(&store, "trip-1", 1).await;

    let err = daemon
        .wait_for_shard_state("Exploding:All", 3, WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardFaulted { .. }));

    let status = daemon.shard_status("Exploding:All").unwrap();
    assert_eq!(status.state, ShardState::Faulted);
    assert_eq!(status.last_seen.as_raw(), 0);
    assert!(status.error.unwrap().contains("cannot project this"));

    // Other shards are unaffected.
    daemon.wait_for_shard_state("Distance:All", 3, WAIT).await.unwrap();

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}

/// Fails with `SQLITE_BUSY` for the first `busy_pages` pages, then projects normally.
struct Busy {
    inner: CompiledFlatTable,
    busy_pages: u32,
    calls: Arc<AtomicU32>,
}

impl Projection for Busy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn shards(&self) -> Vec<ShardDefinition> {
        self.inner.shards()
    }

    fn tables(&self) -> Vec<Table> {
        self.inner.tables()
    }

    fn apply(&self, ctx: &ApplyContext<'_>, events: &[Event]) -> spitefold::Result<Vec<ProjectionOp>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.busy_pages {
            return Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_string()),
            )));
        }
        self.inner.apply(ctx, events)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_failures_retry_without_faulting() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(
        store.clone(),
        DaemonConfig {
            max_unexpected_failures: 2,
            ..fast_daemon_config()
        },
    );

    let calls = Arc::new(AtomicU32::new(0));
    let busy_pages = 10;
    daemon
        .add_projection(Busy {
            inner: distance_projection(),
            busy_pages,
            calls: Arc::clone(&calls),
        })
        .await
        .unwrap();

    for i in 1..=3u32 {
        append_journey(&store, &format!("trip-{i}"), i).await;
    }
    daemon.start_all().await.unwrap();

    // Well past the unexpected-failure limit, still retrying the first page.
    eventually(WAIT, Duration::from_millis(1), || (calls.load(Ordering::SeqCst) >= 4).then_some(())).await;
    let status = daemon.shard_status("Distance:All").unwrap();
    assert_ne!(status.state, ShardState::Faulted);
    assert_eq!(status.last_seen.as_raw(), 0);
    assert!(store.query_table("distance", "id").await.unwrap().is_empty());

    let status = daemon.wait_for_shard_state("Distance:All", 9, WAIT).await.unwrap();
    assert_eq!(status.state, ShardState::Running);
    assert!(status.error.is_none());
    assert!(calls.load(Ordering::SeqCst) > busy_pages);

    let rows = store.query_table("distance", "id").await.unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row["legs"].as_i64(), Some(1));
    }

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}
