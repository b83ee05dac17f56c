//! # Error Handling for spitefold
//!
//! A single error enum ([`Error`]) covers the event store, the aggregator, the
//! flattened-projection compiler and the projection daemon. Library users match
//! on one type; internal code propagates with `?`.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | `Conflict` | Re-read the stream and retry |
//! | Not found | `EventNotFound`, `ProjectionNotFound`, `ShardNotFound` | Report to caller |
//! | Configuration | `Configuration`, `NotSupported` | Fix the projection setup; never retried |
//! | Transient | busy/locked SQLite, `Timeout` | Shards back off and retry the same page |
//! | Lifecycle | `Cancelled`, `RebuildInProgress`, `ShardFaulted`, `Closed` | Caller decides |
//! | Internal | `Sqlite`, `Serialization`, `Schema`, `Corrupted` | Log and investigate |
//!
//! Stream absence is deliberately *not* an error: fetching an unknown stream
//! yields no events and a stream state at version 0.

use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in spitefold operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// Optimistic concurrency conflict: the stream was modified since last read.
    ///
    /// # When This Happens
    ///
    /// Every append carries the revision the writer believes is current. The
    /// writer thread compares it with the stored stream head; any mismatch
    /// fails the append without writing anything.
    ///
    /// # Recovery
    ///
    /// 1. Re-fetch the stream (or its state)
    /// 2. Re-apply business logic
    /// 3. Retry with the new expected revision
    ///
    /// Never retried internally.
    #[error("conflict on stream '{stream}': expected revision {expected}, but found {actual}")]
    Conflict {
        /// The stream where the conflict occurred
        stream: String,
        /// The revision the client expected
        expected: u64,
        /// The actual current revision
        actual: u64,
    },

    // =========================================================================
    // Not Found
    // =========================================================================

    /// A single-event load referenced an id that is not in the log.
    #[error("event '{0}' not found")]
    EventNotFound(Uuid),

    /// A typed load found the event, but its payload is a different type.
    #[error("event '{event_id}' has type '{actual}', expected '{expected}'")]
    WrongEventType {
        /// The event that was loaded
        event_id: Uuid,
        /// The type the caller asked for
        expected: String,
        /// The type recorded in the log
        actual: String,
    },

    /// No projection with this name is registered with the daemon.
    #[error("projection '{0}' is not registered")]
    ProjectionNotFound(String),

    /// No shard with this name is registered with the daemon.
    #[error("shard '{0}' is not registered")]
    ShardNotFound(String),

    // =========================================================================
    // Configuration Errors (Fail fast at setup)
    // =========================================================================

    /// A projection, filter or store option is misconfigured.
    ///
    /// # When This Happens
    ///
    /// - A column map cannot resolve the value it requires
    /// - A shard's filters can never match anything (empty allow-list)
    /// - A stream identity uses the scheme the store is not configured for
    /// - Two projections or shards share a name
    ///
    /// Detected when the projection is added or compiled, before any shard runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation is not supported by this column map or component.
    ///
    /// Raised when asking a column map that takes no input for its value
    /// accessor; this signals a misconfigured mapping, not bad event data.
    #[error("not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Daemon Lifecycle
    // =========================================================================

    /// A shard did not reach the requested position in time.
    #[error("timed out waiting for shard '{shard}' to reach {target} (reached {reached})")]
    Timeout {
        /// Shard name, e.g. `Distance:All`
        shard: String,
        /// Position that was waited for
        target: u64,
        /// Last position recorded before the timeout
        reached: u64,
    },

    /// The shard moved to `Faulted` and will not make further progress until restarted.
    #[error("shard '{shard}' is faulted: {reason}")]
    ShardFaulted {
        /// Shard name
        shard: String,
        /// Last unexpected error recorded by the shard
        reason: String,
    },

    /// A rebuild of this projection is running; normal processing is excluded.
    #[error("projection '{0}' is being rebuilt")]
    RebuildInProgress(String),

    /// The operation observed its cancellation signal and did not complete.
    #[error("operation cancelled")]
    Cancelled,

    /// The writer or reader threads have shut down.
    #[error("store is closed: {0}")]
    Closed(String),

    // =========================================================================
    // Internal Errors (Investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Busy and locked errors are transient (see [`Error::is_transient`]);
    /// everything else usually indicates a bug or a damaged database file.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema version mismatch or an invalid stored value.
    #[error("schema error: {0}")]
    Schema(String),

    /// Stored payload checksum does not match its bytes.
    #[error("corrupted payload at global position {global_pos}")]
    Corrupted {
        /// Position of the damaged event
        global_pos: u64,
    },
}

impl Error {
    /// Returns true if retrying the same operation later may succeed.
    ///
    /// Shards retry transient failures on the same page with backoff and count
    /// everything else toward the fault threshold.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
