//! # Batch Writer with Group Commit
//!
//! All writes go through one thread that owns the only read-write connection.
//! Appends are collected over a short window and executed in a single SQLite
//! transaction, with a SAVEPOINT per command so one conflict never sinks the
//! rest of the batch.
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ cmd1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ cmd2 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_0        │
//! │ cmd3 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_1        │
//! │ ...                      │     │   SAVEPOINT cmd_2        │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Staged vs Committed State
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     In-Memory State                         │
//! │                                                             │
//! │  ┌─────────────────────┐    ┌─────────────────────────────┐ │
//! │  │   heads_committed   │    │       staged.heads          │ │
//! │  │   (mirrors disk)    │    │  (batch-local changes)      │ │
//! │  └─────────────────────┘    └─────────────────────────────┘ │
//! │                                                             │
//! │  Conflict check: staged → committed                         │
//! │                                                             │
//! │  After COMMIT: staged → committed, publish head             │
//! │  After ROLLBACK: discard staged                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Other Writes
//!
//! Projection page commits, table DDL and rebuild swaps share the same
//! connection. They are rare next to appends, so the pending append batch is
//! flushed first and the request runs on its own.
//!
//! ## Invariants
//!
//! - Memory never leads disk (staged/committed separation)
//! - Global position strictly increases, no gaps
//! - Stream revisions strictly increase per stream, no gaps
//! - Exactly one of two appends expecting the same revision succeeds

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::flattened::Table;
use crate::schema::ensure_event_storage;
use crate::storage::{self, PageCommit, StreamHead, StreamKey};
use crate::subscription::HeadNotifier;
use crate::types::{AppendCommand, AppendResult, GlobalPos, StreamRev};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Request Types
// =============================================================================

/// A request handled by the writer thread.
pub enum WriteRequest {
    /// Single append command (group committed).
    Append {
        command: AppendCommand,
        response: oneshot::Sender<Result<AppendResult>>,
    },

    /// Several appends that succeed or fail together (group committed).
    AppendAll {
        commands: Vec<AppendCommand>,
        response: oneshot::Sender<Result<Vec<AppendResult>>>,
    },

    /// Creates the event log tables if missing.
    EnsureEventStorage { response: oneshot::Sender<Result<()>> },

    /// Projected state plus shard progress, in one transaction.
    CommitPage {
        commit: PageCommit,
        response: oneshot::Sender<Result<()>>,
    },

    /// Creates or widens projection tables, given as `(schema, table name)`.
    EnsureTables {
        tables: Vec<(Table, String)>,
        response: oneshot::Sender<Result<()>>,
    },

    /// Drops tables by name.
    DropTables {
        names: Vec<String>,
        response: oneshot::Sender<Result<()>>,
    },

    /// Swaps rebuilt shadow tables in and resets shard progress.
    SwapRebuild {
        swaps: Vec<(String, String)>,
        progress: Vec<(String, GlobalPos)>,
        response: oneshot::Sender<Result<()>>,
    },

    /// Flushes pending appends and stops the thread.
    Shutdown,
}

/// Where to send the outcome of a pending append.
enum Responder {
    Single(oneshot::Sender<Result<AppendResult>>),
    All(oneshot::Sender<Result<Vec<AppendResult>>>),
}

impl Responder {
    fn send(self, result: Result<Vec<AppendResult>>) {
        match self {
            Responder::Single(tx) => {
                let _ = tx.send(result.map(|mut results| results.remove(0)));
            }
            Responder::All(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// An append group waiting for the current batch to commit.
struct Pending {
    commands: Vec<AppendCommand>,
    responder: Responder,
}

// =============================================================================
// Staged State
// =============================================================================

/// Stream heads changed by the open batch, discarded on rollback.
struct StagedState {
    heads: HashMap<StreamKey, StreamHead>,
    next_pos: GlobalPos,
}

impl StagedState {
    fn new(next_pos: GlobalPos) -> Self {
        Self {
            heads: HashMap::new(),
            next_pos,
        }
    }

    fn clear(&mut self, next_pos: GlobalPos) {
        self.heads.clear();
        self.next_pos = next_pos;
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The single writer. Runs on a dedicated thread; use [`WriterHandle`] to talk to it.
pub struct BatchWriter {
    conn: Connection,

    /// `None` until the event log tables exist and the heads are loaded.
    heads_committed: Option<HashMap<StreamKey, StreamHead>>,

    staged: StagedState,

    next_pos_committed: GlobalPos,

    notifier: HeadNotifier,
}

impl BatchWriter {
    /// Wraps an initialized connection. Loads stream heads if the log already exists.
    pub fn new(conn: Connection, notifier: HeadNotifier) -> Result<Self> {
        let mut writer = Self {
            conn,
            heads_committed: None,
            staged: StagedState::new(GlobalPos::FIRST),
            next_pos_committed: GlobalPos::FIRST,
            notifier,
        };

        if crate::schema::event_storage_exists(&writer.conn)? {
            writer.load_state()?;
        }

        Ok(writer)
    }

    fn load_state(&mut self) -> Result<()> {
        let heads = storage::load_stream_heads(&self.conn)?;
        self.next_pos_committed = storage::load_next_global_pos(&self.conn)?;
        self.staged.clear(self.next_pos_committed);
        self.heads_committed = Some(heads);

        if self.next_pos_committed > GlobalPos::FIRST {
            self.notifier
                .publish(GlobalPos::from_raw_unchecked(self.next_pos_committed.as_raw() - 1));
        }
        Ok(())
    }

    /// Creates the event log on first use.
    fn ensure_event_storage(&mut self) -> Result<()> {
        if self.heads_committed.is_some() {
            return Ok(());
        }
        ensure_event_storage(&self.conn)?;
        self.load_state()?;
        tracing::debug!("event storage ready");
        Ok(())
    }

    /// Head of a stream, staged first, then committed.
    fn stream_head(&self, key: &StreamKey) -> Option<&StreamHead> {
        self.staged.heads.get(key).or_else(|| {
            self.heads_committed
                .as_ref()
                .and_then(|committed| committed.get(key))
        })
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch of appends and answers every caller.
    ///
    /// 1. Begin outer transaction
    /// 2. Run each pending append in its own SAVEPOINT
    /// 3. Commit, merge staged heads, publish the new head
    fn execute_batch(&mut self, items: Vec<Pending>) {
        if items.is_empty() {
            return;
        }

        let (groups, responders): (Vec<_>, Vec<_>) =
            items.into_iter().map(|p| (p.commands, p.responder)).unzip();

        if let Err(e) = self.ensure_event_storage() {
            fail_all(responders, &e);
            return;
        }

        self.staged.clear(self.next_pos_committed);

        let started = Instant::now();
        match self.execute_batch_inner(&groups) {
            Ok(outcomes) => {
                self.commit_staged_state();

                tracing::debug!(
                    commands = groups.len(),
                    head = %self.notifier.current(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "batch committed"
                );

                for (responder, outcome) in responders.into_iter().zip(outcomes) {
                    responder.send(outcome);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, commands = groups.len(), "batch commit failed");
                self.staged.clear(self.next_pos_committed);
                fail_all(responders, &e);
            }
        }
    }

    fn execute_batch_inner(&mut self, groups: &[Vec<AppendCommand>]) -> Result<Vec<Result<Vec<AppendResult>>>> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;

        let mut savepoint_counter = 0;
        let mut outcomes = Vec::with_capacity(groups.len());

        for group in groups {
            match self.execute_group_in_savepoint(group, &mut savepoint_counter) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            }
        }

        match self.conn.execute("COMMIT", []) {
            Ok(_) => Ok(outcomes),
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e.into())
            }
        }
    }

    /// Runs a group of appends inside one SAVEPOINT.
    ///
    /// The outer `Result` carries failures that poison the whole transaction;
    /// the inner one carries per-command failures (conflicts) that only roll
    /// back this SAVEPOINT.
    fn execute_group_in_savepoint(
        &mut self,
        group: &[AppendCommand],
        savepoint_counter: &mut usize,
    ) -> Result<Result<Vec<AppendResult>>> {
        let sp_name = format!("cmd_{}", *savepoint_counter);
        *savepoint_counter += 1;

        let staged_before = (self.staged.heads.clone(), self.staged.next_pos);
        self.conn.execute(&format!("SAVEPOINT {}", sp_name), [])?;

        let mut results = Vec::with_capacity(group.len());
        for cmd in group {
            match self.execute_command(cmd) {
                Ok(result) => results.push(result),
                Err(e) => {
                    self.conn.execute(&format!("ROLLBACK TO {}", sp_name), [])?;
                    self.conn.execute(&format!("RELEASE {}", sp_name), [])?;
                    self.staged.heads = staged_before.0;
                    self.staged.next_pos = staged_before.1;
                    return Ok(Err(e));
                }
            }
        }

        self.conn.execute(&format!("RELEASE {}", sp_name), [])?;
        Ok(Ok(results))
    }

    /// Checks the expected revision and writes one command.
    fn execute_command(&mut self, cmd: &AppendCommand) -> Result<AppendResult> {
        let key: StreamKey = (cmd.tenant.as_str().to_string(), cmd.stream.storage_key());
        let head = self.stream_head(&key).cloned();

        let current_rev = head.as_ref().map(|h| h.version).unwrap_or(StreamRev::NONE);
        if current_rev != cmd.expected_rev {
            tracing::debug!(
                stream = %cmd.stream,
                expected = %cmd.expected_rev,
                actual = %current_rev,
                "append conflict"
            );
            return Err(Error::Conflict {
                stream: cmd.stream.to_string(),
                expected: cmd.expected_rev.as_raw(),
                actual: current_rev.as_raw(),
            });
        }

        let (result, new_head) = storage::insert_events(&self.conn, cmd, head.as_ref(), self.staged.next_pos)?;

        self.staged.next_pos = result.last_pos.next();
        self.staged.heads.insert(key, new_head);

        Ok(result)
    }

    /// Merges staged heads into committed state and publishes the new head.
    fn commit_staged_state(&mut self) {
        self.next_pos_committed = self.staged.next_pos;

        if let Some(committed) = self.heads_committed.as_mut() {
            committed.extend(self.staged.heads.drain());
        }

        if self.next_pos_committed > GlobalPos::FIRST {
            self.notifier
                .publish(GlobalPos::from_raw_unchecked(self.next_pos_committed.as_raw() - 1));
        }
    }

    // =========================================================================
    // Immediate Requests
    // =========================================================================

    fn commit_page(&mut self, commit: &PageCommit) -> Result<()> {
        storage::commit_page(&mut self.conn, commit)
    }

    fn ensure_tables(&mut self, tables: &[(Table, String)]) -> Result<()> {
        for (table, name) in tables {
            storage::ensure_table(&self.conn, table, name)?;
        }
        Ok(())
    }

    fn drop_tables(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            storage::drop_table(&self.conn, name)?;
        }
        Ok(())
    }

    fn swap_rebuild(&mut self, swaps: &[(String, String)], progress: &[(String, GlobalPos)]) -> Result<()> {
        storage::swap_rebuilt_tables(&mut self.conn, swaps, progress)
    }
}

fn fail_all(responders: Vec<Responder>, e: &Error) {
    for responder in responders {
        responder.send(Err(batch_error(e)));
    }
}

/// Per-caller copy of a batch failure. SQLite result codes survive so busy
/// and locked failures stay transient.
fn batch_error(e: &Error) -> Error {
    match e {
        Error::Sqlite(rusqlite::Error::SqliteFailure(code, message)) => {
            Error::Sqlite(rusqlite::Error::SqliteFailure(*code, message.clone()))
        }
        other => Error::Closed(format!("batch commit failed: {}", other)),
    }
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Handle to the writer thread.
///
/// Async methods are used from tokio tasks; the `*_blocking` variants serve
/// synchronous callers and must not be called from inside a runtime.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Closed("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Closed("writer dropped response".to_string()))?
    }

    fn request_blocking<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .blocking_send(make(response_tx))
            .map_err(|_| Error::Closed("writer has shut down".to_string()))?;

        response_rx
            .blocking_recv()
            .map_err(|_| Error::Closed("writer dropped response".to_string()))?
    }

    /// Appends events to a stream.
    pub async fn append(&self, command: AppendCommand) -> Result<AppendResult> {
        self.request(|response| WriteRequest::Append { command, response })
            .await
    }

    /// Appends to several streams atomically: all commands commit or none do.
    pub async fn append_all(&self, commands: Vec<AppendCommand>) -> Result<Vec<AppendResult>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.request(|response| WriteRequest::AppendAll { commands, response })
            .await
    }

    pub async fn ensure_event_storage(&self) -> Result<()> {
        self.request(|response| WriteRequest::EnsureEventStorage { response })
            .await
    }

    pub async fn commit_page(&self, commit: PageCommit) -> Result<()> {
        self.request(|response| WriteRequest::CommitPage { commit, response })
            .await
    }

    pub async fn ensure_tables(&self, tables: Vec<(Table, String)>) -> Result<()> {
        self.request(|response| WriteRequest::EnsureTables { tables, response })
            .await
    }

    pub async fn drop_tables(&self, names: Vec<String>) -> Result<()> {
        self.request(|response| WriteRequest::DropTables { names, response })
            .await
    }

    pub async fn swap_rebuild(&self, swaps: Vec<(String, String)>, progress: Vec<(String, GlobalPos)>) -> Result<()> {
        self.request(|response| WriteRequest::SwapRebuild {
            swaps,
            progress,
            response,
        })
        .await
    }

    /// Blocking form of [`WriterHandle::append`].
    pub fn append_blocking(&self, command: AppendCommand) -> Result<AppendResult> {
        self.request_blocking(|response| WriteRequest::Append { command, response })
    }

    /// Blocking form of [`WriterHandle::append_all`].
    pub fn append_all_blocking(&self, commands: Vec<AppendCommand>) -> Result<Vec<AppendResult>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.request_blocking(|response| WriteRequest::AppendAll { commands, response })
    }

    pub fn ensure_event_storage_blocking(&self) -> Result<()> {
        self.request_blocking(|response| WriteRequest::EnsureEventStorage { response })
    }

    /// Asks the writer to flush and stop. Later requests fail with `Closed`.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Collects appends into batches and runs everything else immediately.
pub async fn run_batch_writer(mut writer: BatchWriter, mut rx: mpsc::Receiver<WriteRequest>, config: StoreConfig) {
    let mut batch: Vec<Pending> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
            None => Duration::from_secs(3600),
        };

        let request = match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
                continue;
            }
        };

        let pending = match request {
            WriteRequest::Append { command, response } => Pending {
                commands: vec![command],
                responder: Responder::Single(response),
            },
            WriteRequest::AppendAll { commands, response } => Pending {
                commands,
                responder: Responder::All(response),
            },
            WriteRequest::Shutdown => {
                writer.execute_batch(std::mem::take(&mut batch));
                tracing::debug!("writer shutting down");
                break;
            }
            immediate => {
                // Keep request order: appends queued before this one commit first.
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
                run_immediate(&mut writer, immediate);
                continue;
            }
        };

        if batch.is_empty() {
            batch_start = Some(Instant::now());
        }
        batch.push(pending);

        if batch.len() >= config.batch_max_size {
            writer.execute_batch(std::mem::take(&mut batch));
            batch_start = None;
        }
    }
}

fn run_immediate(writer: &mut BatchWriter, request: WriteRequest) {
    match request {
        WriteRequest::EnsureEventStorage { response } => {
            let _ = response.send(writer.ensure_event_storage());
        }
        WriteRequest::CommitPage { commit, response } => {
            let _ = response.send(writer.commit_page(&commit));
        }
        WriteRequest::EnsureTables { tables, response } => {
            let _ = response.send(writer.ensure_tables(&tables));
        }
        WriteRequest::DropTables { names, response } => {
            let _ = response.send(writer.drop_tables(&names));
        }
        WriteRequest::SwapRebuild {
            swaps,
            progress,
            response,
        } => {
            let _ = response.send(writer.swap_rebuild(&swaps, &progress));
        }
        WriteRequest::Append { .. } | WriteRequest::AppendAll { .. } | WriteRequest::Shutdown => {}
    }
}

/// Spawns the writer on a dedicated thread with its own single-threaded runtime.
pub fn spawn_batch_writer(conn: Connection, notifier: HeadNotifier, config: StoreConfig) -> Result<WriterHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

    let writer = BatchWriter::new(conn, notifier)?;

    std::thread::Builder::new()
        .name("spitefold-writer".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "failed to create writer runtime");
                    return;
                }
            };

            rt.block_on(run_batch_writer(writer, rx, config));
        })
        .map_err(|e| Error::Closed(format!("failed to spawn writer thread: {}", e)))?;

    Ok(WriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::types::{EventData, StreamIdentity, TenantId};

    fn spawn_test_writer(config: StoreConfig) -> (WriterHandle, HeadNotifier) {
        let db = Database::open_in_memory().unwrap();
        let notifier = HeadNotifier::new(GlobalPos::NONE);
        let handle = spawn_batch_writer(db.into_connection(), notifier.clone(), config).unwrap();
        (handle, notifier)
    }

    fn cmd(stream: &str, expected: u64, count: usize) -> AppendCommand {
        let events = (0..count)
            .map(|i| EventData::new("tick", format!("{{\"n\":{}}}", i).into_bytes()))
            .collect();
        AppendCommand::new(StreamIdentity::key(stream), StreamRev::from_raw(expected), events)
    }

    #[tokio::test]
    async fn test_single_append_publishes_head() {
        let (handle, notifier) = spawn_test_writer(StoreConfig::default());

        let result = handle.append(cmd("a", 0, 3)).await.unwrap();
        assert_eq!(result.first_pos, GlobalPos::FIRST);
        assert_eq!(result.last_rev.as_raw(), 3);
        assert_eq!(notifier.current().as_raw(), 3);
    }

    #[tokio::test]
    async fn test_conflict_does_not_affect_others() {
        let config = StoreConfig {
            batch_timeout: Duration::from_millis(50),
            ..StoreConfig::default()
        };
        let (handle, _) = spawn_test_writer(config);
        handle.append(cmd("b", 0, 1)).await.unwrap();

        let (ok, conflict, ok2) = tokio::join!(
            handle.append(cmd("c", 0, 2)),
            handle.append(cmd("b", 0, 1)),
            handle.append(cmd("b", 1, 1)),
        );

        assert!(ok.is_ok());
        assert!(matches!(conflict, Err(Error::Conflict { actual: 1, .. })));
        assert_eq!(ok2.unwrap().last_rev.as_raw(), 2);
    }

    #[tokio::test]
    async fn test_append_all_is_atomic() {
        let (handle, notifier) = spawn_test_writer(StoreConfig::default());
        handle.append(cmd("x", 0, 1)).await.unwrap();

        let result = handle.append_all(vec![cmd("y", 0, 1), cmd("x", 0, 1)]).await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(notifier.current().as_raw(), 1);

        // "y" was rolled back with the group, so it can still be created at revision 0.
        let results = handle.append_all(vec![cmd("y", 0, 1), cmd("x", 1, 1)]).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].last_pos.as_raw(), 3);
    }

    #[tokio::test]
    async fn test_tenants_have_separate_streams() {
        let (handle, _) = spawn_test_writer(StoreConfig::default());

        handle.append(cmd("shared", 0, 1)).await.unwrap();
        let other = cmd("shared", 0, 1).with_tenant(TenantId::new("acme"));
        let result = handle.append(other).await.unwrap();
        assert_eq!(result.first_rev, StreamRev::FIRST);
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_unique_positions() {
        let config = StoreConfig {
            batch_timeout: Duration::from_millis(20),
            ..StoreConfig::default()
        };
        let (handle, _) = spawn_test_writer(config);

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.append(cmd(&format!("s{}", i), 0, 2)).await })
            })
            .collect();

        let mut positions = Vec::new();
        for task in futures::future::join_all(tasks).await {
            let result = task.unwrap().unwrap();
            positions.push(result.first_pos.as_raw());
            positions.push(result.last_pos.as_raw());
        }
        positions.sort_unstable();
        assert_eq!(positions, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let (handle, _) = spawn_test_writer(StoreConfig::default());
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(handle.append(cmd("z", 0, 1)).await, Err(Error::Closed(_))));
    }

    #[test]
    fn test_batch_error_keeps_busy_transient() {
        let busy = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ));
        let copy = batch_error(&busy);
        assert!(copy.is_transient());
        assert_eq!(copy.to_string(), busy.to_string());

        let other = batch_error(&Error::Schema("bad".to_string()));
        assert!(matches!(other, Error::Closed(_)));
        assert!(!other.is_transient());
    }
}
