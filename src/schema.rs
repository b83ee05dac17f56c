//! # SQLite Schema for spitefold
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  events                              streams                            │
//! │  ┌─────────────────────┐             ┌──────────────────────┐           │
//! │  │ global_pos (PK)     │             │ tenant_id, stream    │ (PK)      │
//! │  │ event_id (UNIQUE)   │             │ stream_type          │           │
//! │  │ tenant_id, stream ──┼────────────►│ version              │           │
//! │  │ stream_rev          │             │ last_pos             │           │
//! │  │ event_type          │             └──────────────────────┘           │
//! │  │ stream_type         │                                                │
//! │  │ checksum, data      │             projection_progress                │
//! │  └─────────────────────┘             ┌──────────────────────┐           │
//! │                                      │ shard_name (PK)      │           │
//! │                                      │ last_seen            │           │
//! │                                      └──────────────────────┘           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lazy Event Storage
//!
//! `Database::open` creates only the metadata and progress tables. The event
//! tables are created by [`ensure_event_storage`] the first time the store
//! reads or appends; the call is idempotent.
//!
//! ## Why denormalize `stream_type` onto events?
//!
//! Shards filter the global log by stream type. Copying the stream's type onto
//! each event row at append time keeps page reads a single indexed scan with
//! no join.

use rusqlite::{Connection, OptionalExtension};

use crate::types::StreamIdentityMode;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `events` table is the append-only log.
///
/// # Columns
///
/// - `global_pos`: Position in the whole log, assigned by the single writer
/// - `event_id`: UUID, unique, used by single-event loads
/// - `stream`: Stream UUID (hyphenated) or string key, per the store's identity mode
/// - `stream_rev`: 1-based revision within the stream
/// - `timestamp_ms`: Append time, used by `as_of` fetches
/// - `checksum`: XXH3 of `data`, verified on read
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    global_pos   INTEGER PRIMARY KEY,
    event_id     TEXT NOT NULL UNIQUE,
    tenant_id    TEXT NOT NULL,
    stream       TEXT NOT NULL,
    stream_rev   INTEGER NOT NULL,
    event_type   TEXT NOT NULL,
    stream_type  TEXT,
    timestamp_ms INTEGER NOT NULL,
    checksum     INTEGER NOT NULL,
    data         BLOB NOT NULL,
    metadata     BLOB
)
"#;

/// Stream reads and the database-level revision uniqueness backstop.
const CREATE_EVENTS_STREAM_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS events_stream_rev
ON events(tenant_id, stream, stream_rev)
"#;

/// Shard page reads filtered by event type.
const CREATE_EVENTS_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_type_pos
ON events(event_type, global_pos)
"#;

/// Current head of every stream.
///
/// The writer keeps an in-memory mirror of this table for conflict checks;
/// readers query it directly for stream state.
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    tenant_id   TEXT NOT NULL,
    stream      TEXT NOT NULL,
    stream_type TEXT,
    version     INTEGER NOT NULL,
    last_pos    INTEGER NOT NULL,
    created_ms  INTEGER NOT NULL,
    updated_ms  INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, stream)
)
"#;

/// Last global position examined by each shard.
///
/// Written in the same transaction as the projected state of a page.
const CREATE_PROJECTION_PROGRESS: &str = r#"
CREATE TABLE IF NOT EXISTS projection_progress (
    shard_name TEXT PRIMARY KEY,
    last_seen  INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL
)
"#;

/// Key/value metadata: schema version and stream identity mode.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitefold_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Creates the event log tables if they do not exist.
pub fn ensure_event_storage(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_EVENTS)?;
    conn.execute_batch(CREATE_EVENTS_STREAM_INDEX)?;
    conn.execute_batch(CREATE_EVENTS_TYPE_INDEX)?;
    conn.execute_batch(CREATE_STREAMS)?;
    Ok(())
}

/// Returns true if the event log tables exist.
pub fn event_storage_exists(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('events', 'streams')",
        [],
        |row| row.get(0),
    )?;
    Ok(count == 2)
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the spitefold schema.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// ```rust,no_run
    /// use spitefold::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// # Ok::<(), spitefold::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while the writer commits.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA busy_timeout = 5000")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_PROJECTION_PROGRESS)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing = self.metadata_value("schema_version")?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO spitefold_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Records the stream identity mode on first use and rejects a different one later.
    ///
    /// Stored stream values are only meaningful under the mode that wrote them.
    pub fn verify_identity_mode(&self, mode: StreamIdentityMode) -> Result<()> {
        let wanted = identity_mode_name(mode);

        match self.metadata_value("stream_identity")? {
            None => {
                self.conn.execute(
                    "INSERT INTO spitefold_metadata (key, value) VALUES ('stream_identity', ?)",
                    [wanted],
                )?;
                Ok(())
            }
            Some(existing) if existing == wanted => Ok(()),
            Some(existing) => Err(Error::Configuration(format!(
                "database streams are identified {existing}, but the store is configured {wanted}"
            ))),
        }
    }

    fn metadata_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM spitefold_metadata WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Consumes the wrapper, returning the connection for the writer thread.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn identity_mode_name(mode: StreamIdentityMode) -> &'static str {
    match mode {
        StreamIdentityMode::AsUuid => "uuid",
        StreamIdentityMode::AsString => "string",
    }
}

// =============================================================================
// Tests
// =============================================================================
