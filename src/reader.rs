//! # Event Reader
//!
//! Read operations run on a pool of threads, each owning a read-only SQLite
//! connection. WAL mode gives every query a consistent snapshot of the last
//! committed state while the writer keeps committing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                               │
//! │                                                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐             │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │             │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │             │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘             │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                   shared job queue                              │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌─────────────┐
//!                    │   SQLite    │
//!                    │   (WAL)     │
//!                    └─────────────┘
//! ```
//!
//! Jobs are closures over a `&Connection`, so the event store, the query
//! builders and the projection shards all share one pool without a request
//! enum per operation.
//!
//! ## Integrity
//!
//! Every payload read from `events` is checked against its stored XXH3
//! checksum; a mismatch surfaces as [`Error::Corrupted`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::codec::compute_checksum;
use crate::error::{Error, Result};
use crate::flattened::{sql_value_to_json, validate_identifier, TENANT_COLUMN};
use crate::types::{
    Event, FetchOptions, GlobalPos, StreamIdentity, StreamIdentityMode, StreamRev, StreamState, TenantId,
};

/// Size of the job queue.
const READ_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Row Mapping
// =============================================================================

const EVENT_COLUMNS: &str = "global_pos, event_id, tenant_id, stream, stream_rev, event_type, \
                             stream_type, timestamp_ms, checksum, data, metadata";

/// An `events` row before checksum and identity validation.
struct RawEventRow {
    global_pos: i64,
    event_id: String,
    tenant: String,
    stream: String,
    stream_rev: i64,
    event_type: String,
    stream_type: Option<String>,
    timestamp_ms: i64,
    checksum: i64,
    data: Vec<u8>,
    metadata: Option<Vec<u8>>,
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEventRow> {
    Ok(RawEventRow {
        global_pos: row.get(0)?,
        event_id: row.get(1)?,
        tenant: row.get(2)?,
        stream: row.get(3)?,
        stream_rev: row.get(4)?,
        event_type: row.get(5)?,
        stream_type: row.get(6)?,
        timestamp_ms: row.get(7)?,
        checksum: row.get(8)?,
        data: row.get(9)?,
        metadata: row.get(10)?,
    })
}

impl RawEventRow {
    fn into_event(self, mode: StreamIdentityMode) -> Result<Event> {
        if compute_checksum(&self.data) != self.checksum {
            return Err(Error::Corrupted {
                global_pos: self.global_pos as u64,
            });
        }

        let event_id = Uuid::parse_str(&self.event_id)
            .map_err(|e| Error::Schema(format!("event id '{}' is not a uuid: {}", self.event_id, e)))?;

        Ok(Event {
            event_id,
            global_pos: GlobalPos::from_raw(self.global_pos as u64),
            stream: StreamIdentity::from_storage(mode, self.stream)?,
            stream_rev: StreamRev::from_raw(self.stream_rev as u64),
            event_type: self.event_type,
            stream_type: self.stream_type,
            timestamp_ms: self.timestamp_ms as u64,
            tenant: TenantId::new(self.tenant),
            data: self.data,
            metadata: self.metadata,
        })
    }
}

fn collect_events(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
    mode: StreamIdentityMode,
) -> Result<Vec<Event>> {
    let rows = stmt.query_map(params, raw_row)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event(mode)?);
    }
    Ok(events)
}

// =============================================================================
// Stream Reads
// =============================================================================

/// Reads a stream's events within `opts`, ordered by revision.
///
/// An unknown stream yields an empty list.
pub fn fetch_stream(
    conn: &Connection,
    mode: StreamIdentityMode,
    tenant: &TenantId,
    stream: &StreamIdentity,
    opts: &FetchOptions,
) -> Result<Vec<Event>> {
    opts.validate()?;

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE tenant_id = ?1 AND stream = ?2 AND stream_rev >= ?3
           AND (?4 IS NULL OR stream_rev <= ?4)
           AND (?5 IS NULL OR timestamp_ms <= ?5)
         ORDER BY stream_rev"
    ))?;

    collect_events(
        &mut stmt,
        params![
            tenant.as_str(),
            stream.storage_key(),
            opts.from_version.as_raw() as i64,
            opts.max_version.map(|v| v.as_raw() as i64),
            opts.as_of_ms.map(|t| t as i64),
        ],
        mode,
    )
}

/// Reads a stream's current state; version 0 when the stream is unknown.
pub fn fetch_stream_state(conn: &Connection, tenant: &TenantId, stream: &StreamIdentity) -> Result<StreamState> {
    let row = conn
        .query_row(
            "SELECT stream_type, version, created_ms, updated_ms FROM streams
             WHERE tenant_id = ? AND stream = ?",
            params![tenant.as_str(), stream.storage_key()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    Ok(match row {
        Some((stream_type, version, created_ms, updated_ms)) => StreamState {
            stream: stream.clone(),
            version: StreamRev::from_raw(version as u64),
            stream_type,
            tenant: tenant.clone(),
            created_ms: created_ms as u64,
            last_timestamp_ms: updated_ms as u64,
        },
        None => StreamState::missing(stream.clone(), tenant.clone()),
    })
}

/// Loads one event by id within a tenant.
pub fn load_event(conn: &Connection, mode: StreamIdentityMode, tenant: &TenantId, event_id: Uuid) -> Result<Event> {
    let row = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ? AND tenant_id = ?"),
            params![event_id.hyphenated().to_string(), tenant.as_str()],
            raw_row,
        )
        .optional()?;

    match row {
        Some(row) => row.into_event(mode),
        None => Err(Error::EventNotFound(event_id)),
    }
}

/// Highest committed global position, `NONE` for an empty log.
pub fn head_position(conn: &Connection) -> Result<GlobalPos> {
    let head: i64 = conn.query_row("SELECT COALESCE(MAX(global_pos), 0) FROM events", [], |row| row.get(0))?;
    Ok(GlobalPos::from_raw_unchecked(head as u64))
}

// =============================================================================
// Log Reads
// =============================================================================

/// A filtered, position-ordered slice of the global log.
///
/// Unset filters match everything. Positions are exclusive below (`after`)
/// and inclusive above (`ceiling`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    pub after: GlobalPos,
    pub ceiling: Option<GlobalPos>,
    pub tenant: Option<TenantId>,
    pub stream: Option<StreamIdentity>,
    pub event_types: Option<Vec<String>>,
    pub stream_types: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl LogQuery {
    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut sql = String::from(" WHERE global_pos > ?");
        let mut values = vec![SqlValue::Integer(self.after.as_raw() as i64)];

        if let Some(ceiling) = self.ceiling {
            sql.push_str(" AND global_pos <= ?");
            values.push(SqlValue::Integer(ceiling.as_raw() as i64));
        }
        if let Some(tenant) = &self.tenant {
            sql.push_str(" AND tenant_id = ?");
            values.push(SqlValue::Text(tenant.as_str().to_string()));
        }
        if let Some(stream) = &self.stream {
            sql.push_str(" AND stream = ?");
            values.push(SqlValue::Text(stream.storage_key()));
        }
        push_in_clause(&mut sql, &mut values, "event_type", self.event_types.as_deref());
        push_in_clause(&mut sql, &mut values, "stream_type", self.stream_types.as_deref());

        (sql, values)
    }
}

fn push_in_clause(sql: &mut String, values: &mut Vec<SqlValue>, column: &str, allowed: Option<&[String]>) {
    let Some(allowed) = allowed else {
        return;
    };
    if allowed.is_empty() {
        // An empty allow-list matches nothing.
        sql.push_str(" AND 0");
        return;
    }
    let marks = vec!["?"; allowed.len()].join(", ");
    sql.push_str(&format!(" AND {} IN ({})", column, marks));
    values.extend(allowed.iter().map(|v| SqlValue::Text(v.clone())));
}

/// Reads events matching `query`, ordered by global position.
pub fn read_log(conn: &Connection, mode: StreamIdentityMode, query: &LogQuery) -> Result<Vec<Event>> {
    let (clause, mut values) = query.where_clause();
    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events{clause} ORDER BY global_pos");
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        values.push(SqlValue::Integer(limit as i64));
    }

    let mut stmt = conn.prepare_cached(&sql)?;
    collect_events(&mut stmt, params_from_iter(values.iter()), mode)
}

/// Counts events matching `query` (the limit is ignored).
pub fn count_log(conn: &Connection, query: &LogQuery) -> Result<u64> {
    let (clause, values) = query.where_clause();
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM events{clause}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// =============================================================================
// Projection Reads
// =============================================================================

/// A stored aggregate document: the stream version it reflects and its JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub version: StreamRev,
    pub data: JsonValue,
}

/// Loads an aggregate document by id, `None` if it was never projected.
pub fn load_document(conn: &Connection, table: &str, tenant: &TenantId, id: &str) -> Result<Option<StoredDocument>> {
    validate_identifier(table)?;

    let row = conn
        .query_row(
            &format!("SELECT version, data FROM {table} WHERE {TENANT_COLUMN} = ? AND id = ?"),
            params![tenant.as_str(), id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    match row {
        Some((version, data)) => Ok(Some(StoredDocument {
            version: StreamRev::from_raw(version as u64),
            data: serde_json::from_str(&data)?,
        })),
        None => Ok(None),
    }
}

/// All aggregate documents of a tenant, ordered by id.
pub fn query_documents(conn: &Connection, table: &str, tenant: &TenantId) -> Result<Vec<(String, StoredDocument)>> {
    validate_identifier(table)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT id, version, data FROM {table} WHERE {TENANT_COLUMN} = ? ORDER BY id"
    ))?;
    let rows = stmt.query_map([tenant.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
    })?;

    let mut documents = Vec::new();
    for row in rows {
        let (id, version, data) = row?;
        documents.push((
            id,
            StoredDocument {
                version: StreamRev::from_raw(version as u64),
                data: serde_json::from_str(&data)?,
            },
        ));
    }
    Ok(documents)
}

fn row_to_map(row: &rusqlite::Row<'_>, names: &[String]) -> rusqlite::Result<Map<String, JsonValue>> {
    let mut map = Map::new();
    for (i, name) in names.iter().enumerate() {
        if name == TENANT_COLUMN {
            continue;
        }
        map.insert(name.clone(), sql_value_to_json(row.get_ref(i)?));
    }
    Ok(map)
}

/// Reads one row of a flattened table as a JSON object, keyed by column name.
pub fn read_table_row(
    conn: &Connection,
    table: &str,
    key_column: &str,
    tenant: &TenantId,
    key: &SqlValue,
) -> Result<Option<Map<String, JsonValue>>> {
    validate_identifier(table)?;
    validate_identifier(key_column)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {table} WHERE {TENANT_COLUMN} = ? AND {key_column} = ?"
    ))?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();

    Ok(stmt
        .query_row(params![tenant.as_str(), key], |row| row_to_map(row, &names))
        .optional()?)
}

/// Reads every row of a flattened table for a tenant, ordered by key.
pub fn query_table(
    conn: &Connection,
    table: &str,
    key_column: &str,
    tenant: &TenantId,
) -> Result<Vec<Map<String, JsonValue>>> {
    validate_identifier(table)?;
    validate_identifier(key_column)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {table} WHERE {TENANT_COLUMN} = ? ORDER BY {key_column}"
    ))?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();

    let rows = stmt.query_map([tenant.as_str()], |row| row_to_map(row, &names))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

// =============================================================================
// Reader Pool
// =============================================================================

/// A unit of read work executed on a pool thread.
pub type ReadJob = Box<dyn FnOnce(&Connection) + Send>;

/// Threads with read-only connections, fed from one shared queue.
///
/// Threads compete for the queue lock; whichever thread is free picks up
/// the next job.
pub struct ReaderPool {
    tx: mpsc::Sender<ReadJob>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderPool {
    /// Spawns `count` reader threads against the database at `path`.
    pub fn spawn(path: &Path, count: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<ReadJob>(READ_CHANNEL_SIZE);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            // Open here so a bad path fails the caller instead of a thread.
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.execute_batch("PRAGMA busy_timeout = 5000")?;

            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("spitefold-reader-{}", i))
                .spawn(move || run_reader(conn, rx))
                .map_err(|e| Error::Closed(format!("failed to spawn reader thread: {}", e)))?;
            handles.push(handle);
        }

        tracing::debug!(threads = count, "reader pool started");

        Ok(Self {
            tx,
            handles: Mutex::new(handles),
        })
    }

    fn job<T, F>(f: F) -> (ReadJob, oneshot::Receiver<Result<T>>)
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: ReadJob = Box::new(move |conn| {
            let _ = response_tx.send(f(conn));
        });
        (job, response_rx)
    }

    /// Runs `f` on a reader thread and awaits its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (job, response_rx) = Self::job(f);
        self.tx
            .send(job)
            .await
            .map_err(|_| Error::Closed("reader pool has shut down".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Closed("reader dropped response".to_string()))?
    }

    /// Blocking form of [`ReaderPool::run`]; must not be called inside a runtime.
    pub fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (job, response_rx) = Self::job(f);
        self.tx
            .blocking_send(job)
            .map_err(|_| Error::Closed("reader pool has shut down".to_string()))?;
        response_rx
            .blocking_recv()
            .map_err(|_| Error::Closed("reader dropped response".to_string()))?
    }

    /// Number of reader threads still attached to the pool.
    pub fn thread_count(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }
}

fn run_reader(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadJob>>>) {
    loop {
        let job = {
            let mut guard = match rx.lock() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            guard.blocking_recv()
        };

        match job {
            Some(job) => job(&conn),
            None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
