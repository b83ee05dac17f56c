//! # Write-Side Storage Primitives
//!
//! Synchronous SQL operations executed by the writer thread. Nothing here
//! manages transactions for appends; the writer wraps every append in a
//! SAVEPOINT inside its group-commit transaction (see [`crate::writer`]).
//! Page commits and rebuild swaps open their own transactions.
//!
//! ## Atomic Page Commit
//!
//! ```text
//! BEGIN IMMEDIATE
//!   ┌──────────────────────────────┐
//!   │ projection ops (upserts ...) │  projected state
//!   ├──────────────────────────────┤
//!   │ projection_progress upsert   │  shard cursor
//!   └──────────────────────────────┘
//! COMMIT                             both or neither
//! ```
//!
//! A crash between pages leaves the cursor at the last committed page, so a
//! restarted shard replays at most the page that was in flight.

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use uuid::Uuid;

use crate::codec::{compute_checksum, current_time_ms};
use crate::error::{Error, Result};
use crate::flattened::Table;
use crate::types::{AppendCommand, AppendResult, GlobalPos, StreamRev};

// =============================================================================
// Stream Heads
// =============================================================================

/// `(tenant_id, stream)` as stored.
pub type StreamKey = (String, String);

/// The writer's view of a stream's current head.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHead {
    pub version: StreamRev,
    pub last_pos: GlobalPos,
    pub stream_type: Option<String>,
    pub created_ms: u64,
}

/// Loads every stream head, keyed by tenant and stream.
pub fn load_stream_heads(conn: &Connection) -> Result<HashMap<StreamKey, StreamHead>> {
    let mut stmt = conn.prepare(
        "SELECT tenant_id, stream, stream_type, version, last_pos, created_ms FROM streams",
    )?;

    let rows = stmt.query_map([], |row| {
        let tenant: String = row.get(0)?;
        let stream: String = row.get(1)?;
        let stream_type: Option<String> = row.get(2)?;
        let version: i64 = row.get(3)?;
        let last_pos: i64 = row.get(4)?;
        let created_ms: i64 = row.get(5)?;

        Ok((
            (tenant, stream),
            StreamHead {
                version: StreamRev::from_raw(version as u64),
                last_pos: GlobalPos::from_raw_unchecked(last_pos as u64),
                stream_type,
                created_ms: created_ms as u64,
            },
        ))
    })?;

    let mut heads = HashMap::new();
    for row in rows {
        let (key, head) = row?;
        heads.insert(key, head);
    }
    Ok(heads)
}

/// Returns the position the next appended event will receive.
pub fn load_next_global_pos(conn: &Connection) -> Result<GlobalPos> {
    let max_pos: Option<i64> = conn.query_row("SELECT MAX(global_pos) FROM events", [], |row| row.get(0))?;

    Ok(match max_pos {
        Some(pos) if pos > 0 => GlobalPos::from_raw_unchecked(pos as u64 + 1),
        _ => GlobalPos::FIRST,
    })
}

// =============================================================================
// Append
// =============================================================================

/// Writes the events of one append command and upserts the stream head.
///
/// The caller has already checked `expected_rev` against `head` and supplies
/// the first global position to use. Returns the result and the new head.
pub fn insert_events(
    conn: &Connection,
    cmd: &AppendCommand,
    head: Option<&StreamHead>,
    first_pos: GlobalPos,
) -> Result<(AppendResult, StreamHead)> {
    let now_ms = current_time_ms();
    let stream = cmd.stream.storage_key();
    let tenant = cmd.tenant.as_str();

    let current_rev = head.map(|h| h.version).unwrap_or(StreamRev::NONE);
    let stream_type = match head {
        Some(h) => h.stream_type.clone(),
        None => cmd.stream_type.clone(),
    };
    let created_ms = head.map(|h| h.created_ms).unwrap_or(now_ms);

    let event_count = cmd.events.len() as u64;
    let last_pos = first_pos.add(event_count - 1);
    let first_rev = current_rev.next();
    let last_rev = first_rev.add(event_count - 1);

    let mut stmt = conn.prepare_cached(
        "INSERT INTO events (global_pos, event_id, tenant_id, stream, stream_rev, event_type,
                             stream_type, timestamp_ms, checksum, data, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;

    let mut pos = first_pos;
    let mut rev = first_rev;
    for event in &cmd.events {
        let event_id = event.event_id.unwrap_or_else(Uuid::new_v4);
        stmt.execute(params![
            pos.as_raw() as i64,
            event_id.hyphenated().to_string(),
            tenant,
            stream,
            rev.as_raw() as i64,
            event.event_type,
            stream_type,
            now_ms as i64,
            compute_checksum(&event.data),
            event.data,
            event.metadata,
        ])?;

        pos = pos.next();
        rev = rev.next();
    }

    conn.execute(
        "INSERT INTO streams (tenant_id, stream, stream_type, version, last_pos, created_ms, updated_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(tenant_id, stream) DO UPDATE SET
             version = excluded.version,
             last_pos = excluded.last_pos,
             updated_ms = excluded.updated_ms",
        params![
            tenant,
            stream,
            stream_type,
            last_rev.as_raw() as i64,
            last_pos.as_raw() as i64,
            created_ms as i64,
            now_ms as i64,
        ],
    )?;

    let new_head = StreamHead {
        version: last_rev,
        last_pos,
        stream_type,
        created_ms,
    };

    Ok((AppendResult::new(first_pos, last_pos, first_rev, last_rev), new_head))
}

// =============================================================================
// Projection Writes
// =============================================================================

/// One SQL statement produced by a projection, with named parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionOp {
    pub sql: String,
    pub params: Vec<(String, SqlValue)>,
}

impl ProjectionOp {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Binds a named parameter (builder pattern). `name` includes the `:` prefix.
    pub fn bind(mut self, name: impl Into<String>, value: SqlValue) -> Self {
        self.params.push((name.into(), value));
        self
    }

    fn execute(&self, conn: &Connection) -> Result<usize> {
        let named: Vec<(&str, &dyn ToSql)> = self
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();
        let mut stmt = conn.prepare_cached(&self.sql)?;
        Ok(stmt.execute(named.as_slice())?)
    }
}

/// Moves a shard cursor from `previous` to `last_seen`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub shard: String,
    pub previous: GlobalPos,
    pub last_seen: GlobalPos,
}

/// Projected state changes and (optionally) a cursor move, committed together.
#[derive(Debug, Clone, Default)]
pub struct PageCommit {
    pub ops: Vec<ProjectionOp>,
    pub progress: Option<ProgressUpdate>,
}

/// Reads a shard's persisted cursor; `GlobalPos::NONE` if it never ran.
pub fn load_progress(conn: &Connection, shard: &str) -> Result<GlobalPos> {
    let last_seen: Option<i64> = conn
        .query_row(
            "SELECT last_seen FROM projection_progress WHERE shard_name = ?",
            [shard],
            |row| row.get(0),
        )
        .optional()?;
    Ok(GlobalPos::from_raw_unchecked(last_seen.unwrap_or(0) as u64))
}

fn write_progress(conn: &Connection, shard: &str, last_seen: GlobalPos) -> Result<()> {
    conn.execute(
        "INSERT INTO projection_progress (shard_name, last_seen, updated_ms) VALUES (?, ?, ?)
         ON CONFLICT(shard_name) DO UPDATE SET
             last_seen = excluded.last_seen,
             updated_ms = excluded.updated_ms",
        params![shard, last_seen.as_raw() as i64, current_time_ms() as i64],
    )?;
    Ok(())
}

/// Applies a page atomically.
///
/// The stored cursor must still equal `progress.previous`; anything else means
/// two writers advanced the same shard and the page is rejected.
pub fn commit_page(conn: &mut Connection, commit: &PageCommit) -> Result<()> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    for op in &commit.ops {
        op.execute(&tx)?;
    }

    if let Some(progress) = &commit.progress {
        let stored = load_progress(&tx, &progress.shard)?;
        if stored != progress.previous {
            return Err(Error::Schema(format!(
                "progress of shard '{}' is {} but the page started from {}",
                progress.shard, stored, progress.previous
            )));
        }
        write_progress(&tx, &progress.shard, progress.last_seen)?;
    }

    tx.commit()?;
    Ok(())
}

// =============================================================================
// Projection Tables
// =============================================================================

/// Creates `table_name` from `table`, adding any columns an older table lacks.
pub fn ensure_table(conn: &Connection, table: &Table, table_name: &str) -> Result<()> {
    conn.execute_batch(&table.create_sql(table_name))?;

    let existing: Vec<String> = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table_name))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        names.collect::<std::result::Result<_, _>>()?
    };

    for column in table.columns() {
        if !existing.iter().any(|name| name == &column.name) {
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {}", table_name, column.ddl()))?;
        }
    }

    Ok(())
}

/// Drops a table if it exists.
pub fn drop_table(conn: &Connection, table_name: &str) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table_name))?;
    Ok(())
}

/// Replaces live tables with their rebuilt shadows and resets shard cursors.
///
/// Runs in one transaction: either every table is swapped and every cursor
/// moved, or nothing changes.
pub fn swap_rebuilt_tables(
    conn: &mut Connection,
    swaps: &[(String, String)],
    progress: &[(String, GlobalPos)],
) -> Result<()> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    for (shadow, live) in swaps {
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {live}; ALTER TABLE {shadow} RENAME TO {live};"
        ))?;
    }

    for (shard, last_seen) in progress {
        write_progress(&tx, shard, *last_seen)?;
    }

    tx.commit()?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
