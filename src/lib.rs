//! # spitefold - Event Sourcing on SQLite
//!
//! spitefold stores events in per-stream order with optimistic concurrency,
//! folds streams into aggregates, and keeps read models up to date with
//! asynchronous projections:
//!
//! - **Event store**: streams, revisions, an ordered global log, tenants
//! - **Live aggregation**: fold one stream into a typed model on demand
//! - **Projections**: sharded tailers that commit projected state and their
//!   cursor atomically, with push wake-ups and all-or-nothing rebuilds
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 EventStore / BlockingEventStore                 │
//! │        (append, fetch, load, aggregate, query raw events)       │
//! └───────────────┬────────────────────────────────┬────────────────┘
//!                 │                                │
//!                 ▼                                ▼
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │         Batch Writer          │   │         Reader Pool         │
//! │  group commit, CAS on append, │   │   read-only connections     │
//! │  projection page commits      │   │                             │
//! └───────────────┬───────────────┘   └──────────────┬──────────────┘
//!                 │ head ──► ProjectionDaemon shards │
//!                 ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: one thread owns the only read-write connection
//! 2. **Durable ordering**: `global_pos` strictly increases, never reused
//! 3. **Stream correctness**: `stream_rev` strictly increases per stream, no gaps
//! 4. **Optimistic concurrency**: of two appends expecting the same revision, one wins
//! 5. **Resumable projections**: projected state and shard progress commit together
//!
//! ## Module Organization
//!
//! - [`error`]: the error enum for all failure modes
//! - [`types`]: positions, revisions, stream identities, events, commands
//! - [`codec`]: serialization contract, typed events, checksums
//! - [`config`]: store and daemon configuration
//! - [`schema`]: SQLite DDL and database initialization
//! - [`storage`]: synchronous write primitives used by the writer
//! - [`writer`]: batch writer with group commit
//! - [`reader`]: read functions and the reader pool
//! - [`subscription`]: head notifications
//! - [`api`]: [`EventStore`] and [`BlockingEventStore`]
//! - [`query`]: raw log queries
//! - [`aggregate`]: [`Aggregator`] for live aggregation
//! - [`flattened`]: flat table projections compiled from column rules
//! - [`projection`]: the projection trait, shards, tracker and daemon

pub mod error;

pub mod types;

pub mod codec;

pub mod config;

pub mod schema;

pub mod storage;

pub mod writer;

pub mod reader;

pub mod subscription;

pub mod api;

pub mod query;

pub mod aggregate;

pub mod flattened;

pub mod projection;

// =============================================================================
// Re-exports
// =============================================================================

pub use aggregate::{Aggregate, Aggregator};
pub use api::{BlockingEventStore, EventStore, TypedEvent};
pub use codec::{DomainEvent, JsonSerializer, Serializer};
pub use config::{DaemonConfig, StoreConfig};
pub use error::{Error, Result};
pub use flattened::{ColumnType, FlatTableProjection};
pub use projection::{
    AggregationProjection, EventFilter, Projection, ProjectionDaemon, ShardDefinition, ShardName, ShardState,
    ShardStateTracker, ShardStatus,
};
pub use query::{RawEventDataQuery, RawEventQuery};
pub use schema::Database;

pub use types::{
    AppendCommand, AppendResult, Event, EventData, EventId, FetchOptions, GlobalPos, StreamIdentity,
    StreamIdentityMode, StreamRev, StreamState, TenantId,
};

pub use tokio_util::sync::CancellationToken;
