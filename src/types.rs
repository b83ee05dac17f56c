//! # Domain Types for spitefold
//!
//! This module defines the core types of the event log: positions, stream
//! identities, events, append commands and stream state snapshots.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Positions are wrapped in single-field structs so a [`GlobalPos`] can never
//! be passed where a [`StreamRev`] is expected:
//!
//! ```rust
//! use spitefold::types::{GlobalPos, StreamRev};
//!
//! fn example(pos: GlobalPos, rev: StreamRev) {
//!     // pos == rev  // Won't compile
//! }
//! ```
//!
//! ## Invariants
//!
//! - [`GlobalPos`]: strictly increasing across the whole log, never reused, first event is 1
//! - [`StreamRev`]: strictly increasing per stream, starts at 1, no gaps
//! - A stream's version equals the revision of its last event (and its event count)

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier of a stored event.
pub type EventId = Uuid;

// =============================================================================
// Positions
// =============================================================================

/// A position in the global event log.
///
/// Shard progress is expressed in global positions: a shard that has seen
/// position N has applied every matching event at or below N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GlobalPos(u64);

impl GlobalPos {
    /// Sentinel meaning "nothing seen yet". Never assigned to an event.
    pub const NONE: GlobalPos = GlobalPos(0);

    /// The first position assigned to an event.
    pub const FIRST: GlobalPos = GlobalPos(1);

    /// Creates a GlobalPos from a raw event position.
    ///
    /// # Panics
    ///
    /// Panics if `value` is 0. Use [`GlobalPos::from_raw_unchecked`] for
    /// values read back from the database, where 0 is a valid progress marker.
    pub fn from_raw(value: u64) -> Self {
        assert!(value > 0, "GlobalPos cannot be zero");
        Self(value)
    }

    /// Creates a GlobalPos without checking for zero.
    pub fn from_raw_unchecked(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for database storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next position.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Adds an offset to this position.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Returns true for the "nothing seen yet" sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GlobalPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A revision number within a stream, also called the stream version.
///
/// - `GlobalPos`: position in the total order across ALL streams
/// - `StreamRev`: position within a SINGLE stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamRev(u64);

impl StreamRev {
    /// The first revision in a stream (1).
    pub const FIRST: StreamRev = StreamRev(1);

    /// Sentinel meaning "stream does not exist" or "no events yet".
    ///
    /// As an expected revision on append it means "I am creating this stream".
    pub const NONE: StreamRev = StreamRev(0);

    /// Creates a StreamRev from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next revision.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Adds an offset to this revision.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Returns true if this represents "no events" (revision 0).
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Stream Identification
// =============================================================================

/// How streams are identified within one store.
///
/// The two schemes are mutually exclusive: a store configured `AsUuid`
/// rejects string keys and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamIdentityMode {
    /// Streams are identified by a surrogate UUID.
    #[default]
    AsUuid,
    /// Streams are identified by a caller-chosen string key.
    AsString,
}

/// The identity of a stream: a surrogate UUID or a caller-chosen key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamIdentity {
    /// Surrogate identifier.
    Uuid(Uuid),
    /// Caller-chosen string key.
    Key(String),
}

impl StreamIdentity {
    /// Creates a string-keyed identity.
    pub fn key(key: impl Into<String>) -> Self {
        StreamIdentity::Key(key.into())
    }

    /// Creates a fresh random UUID identity.
    pub fn new_uuid() -> Self {
        StreamIdentity::Uuid(Uuid::new_v4())
    }

    /// The identity scheme this value belongs to.
    pub fn mode(&self) -> StreamIdentityMode {
        match self {
            StreamIdentity::Uuid(_) => StreamIdentityMode::AsUuid,
            StreamIdentity::Key(_) => StreamIdentityMode::AsString,
        }
    }

    /// Returns the UUID, if this is a UUID identity.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            StreamIdentity::Uuid(id) => Some(*id),
            StreamIdentity::Key(_) => None,
        }
    }

    /// Returns the string key, if this is a keyed identity.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            StreamIdentity::Uuid(_) => None,
            StreamIdentity::Key(key) => Some(key),
        }
    }

    /// The value stored in the `stream` column.
    pub fn storage_key(&self) -> String {
        match self {
            StreamIdentity::Uuid(id) => id.hyphenated().to_string(),
            StreamIdentity::Key(key) => key.clone(),
        }
    }

    /// Rebuilds an identity from its stored form.
    pub fn from_storage(mode: StreamIdentityMode, raw: String) -> Result<Self> {
        match mode {
            StreamIdentityMode::AsString => Ok(StreamIdentity::Key(raw)),
            StreamIdentityMode::AsUuid => Uuid::parse_str(&raw)
                .map(StreamIdentity::Uuid)
                .map_err(|e| Error::Schema(format!("stream id '{}' is not a uuid: {}", raw, e))),
        }
    }

    /// Fails with a configuration error unless this identity uses `mode`.
    pub fn ensure_mode(&self, mode: StreamIdentityMode) -> Result<()> {
        if self.mode() == mode {
            return Ok(());
        }
        Err(Error::Configuration(format!(
            "stream '{}' uses {:?} identity, but the store is configured {:?}",
            self,
            self.mode(),
            mode
        )))
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamIdentity::Uuid(id) => write!(f, "{}", id),
            StreamIdentity::Key(key) => f.write_str(key),
        }
    }
}

impl From<Uuid> for StreamIdentity {
    fn from(id: Uuid) -> Self {
        StreamIdentity::Uuid(id)
    }
}

impl From<&str> for StreamIdentity {
    fn from(key: &str) -> Self {
        StreamIdentity::Key(key.to_string())
    }
}

impl From<String> for StreamIdentity {
    fn from(key: String) -> Self {
        StreamIdentity::Key(key)
    }
}

// =============================================================================
// Tenancy
// =============================================================================

/// Opaque tenant identifier carried on every stream and event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// The tenant used when none is specified.
    pub const DEFAULT: &'static str = "*DEFAULT*";

    /// Creates a tenant id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Event Types
// =============================================================================

/// An event to be appended to a stream.
///
/// This is the "input" form. Position, revision and timestamp are assigned
/// by the writer during append.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Explicit event id; generated at append when absent.
    pub event_id: Option<EventId>,

    /// The event type name used for handler dispatch and shard filtering.
    pub event_type: String,

    /// The serialized payload.
    pub data: Vec<u8>,

    /// Optional serialized metadata (correlation ids and the like).
    pub metadata: Option<Vec<u8>>,
}

impl EventData {
    /// Creates a new event of the given type.
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            data: data.into(),
            metadata: None,
        }
    }

    /// Pins the event id (builder pattern).
    pub fn with_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Adds metadata to this event (builder pattern).
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// A stored event with full position information.
///
/// Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Unique event id.
    pub event_id: EventId,

    /// Position in the global log.
    pub global_pos: GlobalPos,

    /// The stream this event belongs to.
    pub stream: StreamIdentity,

    /// Revision within the stream (1-based).
    pub stream_rev: StreamRev,

    /// Event type name.
    pub event_type: String,

    /// Stream type recorded when the stream was started, if any.
    pub stream_type: Option<String>,

    /// When the event was stored (Unix milliseconds).
    pub timestamp_ms: u64,

    /// Owning tenant.
    pub tenant: TenantId,

    /// The serialized payload.
    pub data: Vec<u8>,

    /// The serialized metadata, if provided.
    pub metadata: Option<Vec<u8>>,
}

impl Event {
    /// The stream's surrogate id, for UUID-identified streams.
    pub fn stream_id(&self) -> Option<Uuid> {
        self.stream.as_uuid()
    }

    /// The stream's string key, for key-identified streams.
    pub fn stream_key(&self) -> Option<&str> {
        self.stream.as_key()
    }

    /// Alias for the stream revision.
    pub fn version(&self) -> StreamRev {
        self.stream_rev
    }
}

// =============================================================================
// Commands and Results
// =============================================================================

/// A command to append events to a stream.
///
/// # Optimistic Concurrency
///
/// `expected_rev` must equal the stream's current version, or
/// [`StreamRev::NONE`] when starting a new stream. Anything else fails with
/// [`Error::Conflict`].
#[derive(Debug, Clone)]
pub struct AppendCommand {
    /// The stream to append to.
    pub stream: StreamIdentity,

    /// Expected current revision of the stream.
    pub expected_rev: StreamRev,

    /// Stream type recorded when the stream is created. Ignored for existing streams.
    pub stream_type: Option<String>,

    /// Owning tenant. The store handle overwrites this with its own scope.
    pub tenant: TenantId,

    /// Events to append. Must contain at least one event.
    pub events: Vec<EventData>,
}

impl AppendCommand {
    /// Creates a new append command.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty.
    pub fn new(
        stream: impl Into<StreamIdentity>,
        expected_rev: StreamRev,
        events: Vec<EventData>,
    ) -> Self {
        assert!(!events.is_empty(), "AppendCommand must have at least one event");
        Self {
            stream: stream.into(),
            expected_rev,
            stream_type: None,
            tenant: TenantId::default(),
            events,
        }
    }

    /// Records the stream type for a new stream (builder pattern).
    pub fn with_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Sets the tenant (builder pattern).
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = tenant;
        self
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Global position of the first appended event.
    pub first_pos: GlobalPos,
    /// Global position of the last appended event.
    pub last_pos: GlobalPos,
    /// Stream revision of the first appended event.
    pub first_rev: StreamRev,
    /// Stream revision of the last appended event (the new stream version).
    pub last_rev: StreamRev,
}

impl AppendResult {
    /// Creates a new append result.
    pub fn new(first_pos: GlobalPos, last_pos: GlobalPos, first_rev: StreamRev, last_rev: StreamRev) -> Self {
        Self {
            first_pos,
            last_pos,
            first_rev,
            last_rev,
        }
    }

    /// Returns the number of events appended.
    pub fn event_count(&self) -> u64 {
        self.last_pos.as_raw() - self.first_pos.as_raw() + 1
    }
}

// =============================================================================
// Stream State
// =============================================================================

/// Point-in-time snapshot of a stream's identity and version.
///
/// An unknown stream is reported as a state with version 0, not as an error.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    /// The stream identity that was asked for.
    pub stream: StreamIdentity,
    /// Current version (event count). `NONE` if the stream does not exist.
    pub version: StreamRev,
    /// Stream type, if recorded.
    pub stream_type: Option<String>,
    /// Owning tenant.
    pub tenant: TenantId,
    /// When the stream was created (Unix milliseconds), 0 if missing.
    pub created_ms: u64,
    /// Timestamp of the most recent append (Unix milliseconds), 0 if missing.
    pub last_timestamp_ms: u64,
}

impl StreamState {
    /// State reported for a stream with no events.
    pub fn missing(stream: StreamIdentity, tenant: TenantId) -> Self {
        Self {
            stream,
            version: StreamRev::NONE,
            stream_type: None,
            tenant,
            created_ms: 0,
            last_timestamp_ms: 0,
        }
    }

    /// Returns true if at least one event has been appended.
    pub fn exists(&self) -> bool {
        !self.version.is_none()
    }
}

// =============================================================================
// Fetch Bounds
// =============================================================================

/// Bounds applied when fetching a stream.
///
/// Versions are 1-based and inclusive; `as_of_ms` excludes events recorded
/// after that instant and keeps events recorded exactly at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// First revision to return (inclusive).
    pub from_version: StreamRev,
    /// Last revision to return (inclusive). Unbounded when `None`.
    pub max_version: Option<StreamRev>,
    /// Only events with a timestamp at or before this instant (Unix milliseconds).
    pub as_of_ms: Option<u64>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            from_version: StreamRev::FIRST,
            max_version: None,
            as_of_ms: None,
        }
    }
}

impl FetchOptions {
    /// Starts at `version` (builder pattern).
    pub fn from_version(mut self, version: u64) -> Self {
        self.from_version = StreamRev::from_raw(version.max(1));
        self
    }

    /// Stops at `version` inclusive (builder pattern).
    pub fn max_version(mut self, version: u64) -> Self {
        self.max_version = Some(StreamRev::from_raw(version));
        self
    }

    /// Excludes events recorded after `timestamp_ms` (builder pattern).
    pub fn as_of(mut self, timestamp_ms: u64) -> Self {
        self.as_of_ms = Some(timestamp_ms);
        self
    }

    /// Checks that `max_version`, if set, is not below `from_version`.
    pub fn validate(&self) -> Result<()> {
        match self.max_version {
            Some(max) if max < self.from_version => Err(Error::Configuration(format!(
                "max_version {} is below from_version {}",
                max, self.from_version
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
