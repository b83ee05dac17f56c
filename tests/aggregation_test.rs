//! Live aggregation and aggregation projections.

mod common;

use std::time::Duration;

use common::{append_trip, fast_daemon_config, open_temp_store, Arrival, Travel, TripEnded, TripStarted};
use serde::{Deserialize, Serialize};
use spitefold::{
    Aggregate, AggregationProjection, Aggregator, AppendCommand, CancellationToken, Error, FetchOptions,
    ProjectionDaemon, StoreConfig, StreamIdentity, StreamRev,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Trip {
    id: String,
    started: u32,
    legs: u32,
    distance: f64,
    states: Vec<String>,
    ended: bool,
}

impl Aggregate for Trip {
    fn set_identity(&mut self, identity: &StreamIdentity) {
        self.id = identity.to_string();
    }
}

fn trip_aggregator() -> Aggregator<Trip> {
    Aggregator::new()
        .create::<TripStarted, _>(|e, _| Trip {
            started: e.day,
            ..Trip::default()
        })
        .apply::<Travel, _>(|trip, e, _| {
            trip.legs += 1;
            trip.distance += e.distance;
        })
        .apply::<Arrival, _>(|trip, e, _| trip.states.push(e.state.clone()))
        .apply::<TripEnded, _>(|trip, _, _| trip.ended = true)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregate_stream_folds_every_event() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let total = append_trip(&store, "trip-1", 4).await;

    let trip = store
        .aggregate_stream(&trip_aggregator(), "trip-1", FetchOptions::default(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trip.id, "trip-1");
    assert_eq!(trip.legs, 4);
    assert_eq!(trip.distance, total);
    assert_eq!(trip.states, vec!["Texas".to_string()]);

    let nothing = store
        .aggregate_stream(&trip_aggregator(), "no-such-trip", FetchOptions::default(), None)
        .await
        .unwrap();
    assert!(nothing.is_none());

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_split_build_matches_full_build() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    append_trip(&store, "trip-1", 6).await;
    let ended = vec![store.event_data(&TripEnded { day: 8 }).unwrap()];
    store
        .append(AppendCommand::new("trip-1", StreamRev::from_raw(8), ended))
        .await
        .unwrap();

    let aggregator = trip_aggregator();
    let full = store
        .aggregate_stream(&aggregator, "trip-1", FetchOptions::default(), None)
        .await
        .unwrap();

    for k in 1..9u64 {
        let prefix = store
            .aggregate_stream(&aggregator, "trip-1", FetchOptions::default().max_version(k), None)
            .await
            .unwrap();
        let resumed = store
            .aggregate_stream(&aggregator, "trip-1", FetchOptions::default().from_version(k + 1), prefix)
            .await
            .unwrap();
        assert_eq!(resumed, full, "split after version {k}");
    }

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_seeded_aggregation_identity() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    append_trip(&store, "trip-1", 1).await;
    let aggregator = trip_aggregator();

    // Range past the end of the stream: nothing to fold, seed or not.
    let seed = Trip {
        legs: 7,
        ..Trip::default()
    };
    let empty = store
        .aggregate_stream(&aggregator, "trip-1", FetchOptions::default().from_version(4), Some(seed.clone()))
        .await
        .unwrap();
    assert!(empty.is_none());
    let blocking = store.blocking();
    let blocking_seed = seed.clone();
    let empty_blocking = tokio::task::spawn_blocking(move || {
        blocking.aggregate_stream(
            &trip_aggregator(),
            "trip-1",
            FetchOptions::default().from_version(4),
            Some(blocking_seed),
        )
    })
    .await
    .unwrap()
    .unwrap();
    assert!(empty_blocking.is_none());

    // Only unhandled events in range: the seed comes back stamped with the stream.
    let unhandled = Aggregator::<Trip>::new().create::<TripEnded, _>(|_, _| Trip::default());
    let stamped = store
        .aggregate_stream(&unhandled, "trip-1", FetchOptions::default(), Some(seed.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stamped.id, "trip-1");
    assert_eq!(stamped.legs, 7);

    let blocking = store.blocking();
    let resumed = tokio::task::spawn_blocking(move || {
        blocking.aggregate_stream(&trip_aggregator(), "trip-1", FetchOptions::default().from_version(2), Some(seed))
    })
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(resumed.id, "trip-1");
    assert_eq!(resumed.legs, 8);

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_aggregation() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    append_trip(&store, "trip-1", 2).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = store
        .aggregate_stream_with_cancel(&trip_aggregator(), "trip-1", FetchOptions::default(), None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregation_projection_matches_live_aggregation() {
    let (_dir, store) = open_temp_store(StoreConfig::with_string_keys()).await;
    let daemon = ProjectionDaemon::new(store.clone(), fast_daemon_config());
    daemon
        .add_projection(AggregationProjection::new("Trips", "trip_docs", trip_aggregator()))
        .await
        .unwrap();
    daemon.start_all().await.unwrap();

    for i in 1..=5u32 {
        append_trip(&store, &format!("trip-{i}"), i).await;
    }
    let ended = vec![store.event_data(&TripEnded { day: 9 }).unwrap()];
    store
        .append(AppendCommand::new("trip-2", StreamRev::from_raw(4), ended))
        .await
        .unwrap();

    daemon.wait_for_non_stale_data(WAIT).await.unwrap();

    let aggregator = trip_aggregator();
    for i in 1..=5u32 {
        let stream = format!("trip-{i}");
        let projected: Trip = store.load_document("trip_docs", stream.as_str()).await.unwrap().unwrap();
        let live = store
            .aggregate_stream(&aggregator, stream.as_str(), FetchOptions::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(projected, live, "{stream}");
    }

    let docs: Vec<Trip> = store.query_documents("trip_docs").await.unwrap();
    assert_eq!(docs.len(), 5);
    assert!(docs.iter().find(|t| t.id == "trip-2").unwrap().ended);

    let missing: Option<Trip> = store.load_document("trip_docs", "trip-99").await.unwrap();
    assert!(missing.is_none());

    // A rebuild reproduces the same documents.
    daemon.rebuild_projection("Trips", &CancellationToken::new()).await.unwrap();
    let rebuilt: Vec<Trip> = store.query_documents("trip_docs").await.unwrap();
    assert_eq!(rebuilt, docs);

    daemon.stop_all().await.unwrap();
    store.shutdown().await;
}
