//! # Asynchronous Projections
//!
//! A projection turns events into read state. The daemon runs each of its
//! shards as an independent task that tails the global log:
//!
//! ```text
//!                 ┌──────────────── ProjectionDaemon ────────────────┐
//!                 │                                                  │
//! events ──► log ─┼─► shard "Distance:All"  ──► page ──► apply ──┐   │
//!                 │                                              ▼   │
//!                 │─► shard "Trips:car"     ──► page ──► apply ──► COMMIT (state + progress)
//!                 │                                              │   │
//!                 │                   ShardStateTracker ◄────────┘   │
//!                 └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Pieces
//!
//! - [`Projection`]: what a projection declares (shards, tables) and how it
//!   turns a page of events into SQL writes
//! - [`ShardName`], [`ShardState`], [`EventFilter`]: shard identity, lifecycle and input
//! - [`ShardStateTracker`]: per-daemon progress registry with waiters
//! - [`AggregationProjection`]: one JSON document per stream, built by an [`Aggregator`](crate::Aggregator)
//! - [`ProjectionDaemon`]: starts, pauses, stops and rebuilds shards
//!
//! Flat table projections live in [`crate::flattened`] and implement the same trait.

mod agent;
mod aggregation;
mod daemon;
mod filter;
mod shard;
mod tracker;

pub use aggregation::{AggregationProjection, DOCUMENT_ID_COLUMN};
pub use daemon::ProjectionDaemon;
pub use filter::EventFilter;
pub use shard::{ShardName, ShardState};
pub use tracker::{ShardStateTracker, ShardStatus};

use rusqlite::Connection;

use crate::codec::Serializer;
use crate::error::Result;
use crate::flattened::Table;
use crate::storage::ProjectionOp;
use crate::types::Event;

/// Suffix of the shadow tables written during a rebuild.
pub const REBUILD_SUFFIX: &str = "__rebuild";

/// Which copy of a projection's tables a page is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableTarget {
    /// The tables readers see.
    Live,
    /// Shadow tables filled by a rebuild and swapped in when it completes.
    Rebuild,
}

impl TableTarget {
    /// Physical table name for `base` under this target.
    pub fn table_name(&self, base: &str) -> String {
        match self {
            TableTarget::Live => base.to_string(),
            TableTarget::Rebuild => format!("{}{}", base, REBUILD_SUFFIX),
        }
    }
}

/// Everything `Projection::apply` may use while computing a page.
pub struct ApplyContext<'a> {
    /// Read-only view of committed state, including the projection's own tables.
    pub conn: &'a Connection,
    pub serializer: &'a dyn Serializer,
    pub target: TableTarget,
}

impl ApplyContext<'_> {
    /// Physical name of one of the projection's tables for this page.
    pub fn table_name(&self, base: &str) -> String {
        self.target.table_name(base)
    }
}

/// A shard a projection runs: its full name and the events it consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardDefinition {
    pub name: ShardName,
    pub filter: EventFilter,
}

/// How a projection splits the log across shards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShardLayout {
    /// One shard, `"<Projection>:All"`.
    #[default]
    Single,
    /// One shard per stream type, `"<Projection>:<streamType>"`.
    PerStreamType(Vec<String>),
}

impl ShardLayout {
    /// Expands the layout into shard definitions sharing `event_types`.
    pub fn shards(&self, projection: &str, event_types: Option<Vec<String>>) -> Vec<ShardDefinition> {
        match self {
            ShardLayout::Single => vec![ShardDefinition {
                name: ShardName::all(projection),
                filter: EventFilter {
                    event_types,
                    stream_types: None,
                },
            }],
            ShardLayout::PerStreamType(stream_types) => stream_types
                .iter()
                .map(|stream_type| ShardDefinition {
                    name: ShardName::new(projection, stream_type.as_str()),
                    filter: EventFilter {
                        event_types: event_types.clone(),
                        stream_types: Some(vec![stream_type.clone()]),
                    },
                })
                .collect(),
        }
    }
}

/// A continuously maintained projection.
///
/// `apply` receives one page of events matching one of the projection's
/// shards, in global order, and returns the writes for that page. The daemon
/// commits those writes together with the shard's progress, so `apply` must
/// not write through `ctx.conn` itself (it is read-only anyway).
///
/// A page may be replayed after a crash; writes must converge when applied
/// twice against the same state.
pub trait Projection: Send + Sync + 'static {
    /// Unique projection name, the prefix of every shard name.
    fn name(&self) -> &str;

    /// Shards to run. Names must be unique across the daemon.
    fn shards(&self) -> Vec<ShardDefinition>;

    /// Tables the projection writes, created before any shard starts.
    fn tables(&self) -> Vec<Table>;

    /// Computes the writes for one page.
    fn apply(&self, ctx: &ApplyContext<'_>, events: &[Event]) -> Result<Vec<ProjectionOp>>;

    /// Setup-time validation; errors here keep the projection from being added.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
