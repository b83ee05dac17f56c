#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spitefold::{
    AppendCommand, DaemonConfig, DomainEvent, EventStore, StoreConfig, StreamIdentity, StreamRev,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn open_temp_store(config: StoreConfig) -> (tempfile::TempDir, EventStore) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let store = EventStore::open_with(dir.path().join("events.db"), config)
        .await
        .expect("open store");
    (dir, store)
}

/// Short delays so tests never wait on the one-second fallback poll.
pub fn fast_daemon_config() -> DaemonConfig {
    DaemonConfig {
        batch_size: 7,
        poll_interval: Duration::from_millis(50),
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(5),
        ..DaemonConfig::default()
    }
}

pub async fn eventually<T>(timeout: Duration, interval: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Trip domain
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripStarted {
    pub day: u32,
}
impl DomainEvent for TripStarted {
    const EVENT_TYPE: &'static str = "trip_started";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Travel {
    pub day: u32,
    pub distance: f64,
}
impl DomainEvent for Travel {
    const EVENT_TYPE: &'static str = "travel";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Arrival {
    pub day: u32,
    pub state: String,
}
impl DomainEvent for Arrival {
    const EVENT_TYPE: &'static str = "arrival";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripEnded {
    pub day: u32,
}
impl DomainEvent for TripEnded {
    const EVENT_TYPE: &'static str = "trip_ended";
}

/// Appends one trip: a start, `legs` travel events (distance 10 * leg), an arrival.
///
/// Returns the total distance travelled.
pub async fn append_trip(store: &EventStore, stream: &str, legs: u32) -> f64 {
    let mut events = vec![store.event_data(&TripStarted { day: 1 }).expect("encode")];
    let mut total = 0.0;
    for leg in 1..=legs {
        let distance = 10.0 * leg as f64;
        total += distance;
        events.push(store.event_data(&Travel { day: leg, distance }).expect("encode"));
    }
    events.push(
        store
            .event_data(&Arrival {
                day: legs + 1,
                state: "Texas".to_string(),
            })
            .expect("encode"),
    );

    store
        .append(AppendCommand::new(StreamIdentity::key(stream), StreamRev::NONE, events).with_stream_type("trip"))
        .await
        .expect("append trip");
    total
}
