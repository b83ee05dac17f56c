//! # Event Store API
//!
//! [`EventStore`] is the async entry point: appends go to the writer thread,
//! reads to the reader pool, and every read first makes sure the event log
//! exists (once per store).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Async Tasks                               │
//! └──────────────────────────────┬───────────────────────────────────────┘
//!                  ┌─────────────┴──────────────┐
//!                  ▼                            ▼
//!          ┌───────────────┐          ┌──────────────────┐
//!          │ Batch Writer  │          │   Reader Pool    │
//!          │  (1 thread)   │          │   (N threads)    │
//!          │   R/W conn    │          │  read-only conns │
//!          └───────┬───────┘          └────────┬─────────┘
//!                  │  publish head             │
//!                  ├──────────► HeadNotifier ──┼──► projection shards
//!                  ▼                           ▼
//!                        ┌─────────────┐
//!                        │   SQLite    │
//!                        │   (WAL)     │
//!                        └─────────────┘
//! ```
//!
//! ## Tenancy
//!
//! A handle is scoped to one tenant. [`EventStore::for_tenant`] returns a
//! handle over the same threads scoped to another tenant; appends are stamped
//! with the handle's tenant and reads only see that tenant's streams.
//!
//! ## Blocking Use
//!
//! [`BlockingEventStore`] offers the same reads and appends for synchronous
//! callers. Its methods block the calling thread and must not be used from
//! inside a Tokio runtime.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{Aggregate, Aggregator};
use crate::codec::{decode_payload, encode_event, DomainEvent, JsonSerializer, Serializer};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::query::{RawEventDataQuery, RawEventQuery};
use crate::reader::{self, ReaderPool};
use crate::schema::Database;
use crate::subscription::{HeadNotifier, HeadSubscription};
use crate::types::{
    AppendCommand, AppendResult, Event, EventData, FetchOptions, GlobalPos, StreamIdentity, StreamIdentityMode,
    StreamState, TenantId,
};
use crate::writer::{spawn_batch_writer, WriterHandle};

/// An event loaded together with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent<T> {
    pub event: Event,
    pub data: T,
}

struct StoreInner {
    path: PathBuf,
    config: StoreConfig,
    writer: WriterHandle,
    readers: ReaderPool,
    notifier: HeadNotifier,
    serializer: Arc<dyn Serializer>,
    storage_ready: AtomicBool,
}

/// Async handle to an event store. Cheap to clone; clones share threads.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
    tenant: TenantId,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.inner.path)
            .field("tenant", &self.tenant)
            .field("identity", &self.inner.config.identity)
            .finish()
    }
}

impl EventStore {
    // =========================================================================
    // Opening
    // =========================================================================

    /// Opens or creates a store at `path` with UUID stream identities.
    ///
    /// ```rust,no_run
    /// # async fn run() -> spitefold::Result<()> {
    /// let store = spitefold::EventStore::open("events.db").await?;
    /// store.shutdown().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreConfig::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open_internal(path.as_ref(), config, Arc::new(JsonSerializer))
    }

    /// Opens a store whose payloads go through `serializer`.
    pub async fn open_with_serializer(
        path: impl AsRef<Path>,
        config: StoreConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        Self::open_internal(path.as_ref(), config, serializer)
    }

    fn open_internal(path: &Path, config: StoreConfig, serializer: Arc<dyn Serializer>) -> Result<Self> {
        let db = Database::open(path)?;
        db.verify_identity_mode(config.identity)?;

        let notifier = HeadNotifier::new(GlobalPos::NONE);
        let writer = spawn_batch_writer(db.into_connection(), notifier.clone(), config.clone())?;
        let readers = ReaderPool::spawn(path, config.reader_count())?;

        tracing::info!(
            path = %path.display(),
            readers = readers.thread_count(),
            identity = ?config.identity,
            serializer = serializer.name(),
            "event store opened"
        );

        let tenant = config.tenant.clone();
        Ok(Self {
            inner: Arc::new(StoreInner {
                path: path.to_path_buf(),
                config,
                writer,
                readers,
                notifier,
                serializer,
                storage_ready: AtomicBool::new(false),
            }),
            tenant,
        })
    }

    /// A handle over the same store scoped to `tenant`.
    pub fn for_tenant(&self, tenant: impl Into<TenantId>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            tenant: tenant.into(),
        }
    }

    /// Synchronous view of this handle.
    pub fn blocking(&self) -> BlockingEventStore {
        BlockingEventStore { store: self.clone() }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn identity_mode(&self) -> StreamIdentityMode {
        self.inner.config.identity
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.inner.serializer)
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.inner.writer
    }

    pub(crate) fn readers(&self) -> &ReaderPool {
        &self.inner.readers
    }

    /// Creates the event log tables if they do not exist yet.
    ///
    /// Reads call this implicitly; after the first success it is free.
    pub async fn ensure_storage(&self) -> Result<()> {
        if self.inner.storage_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.writer.ensure_event_storage().await?;
        self.inner.storage_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_storage_blocking(&self) -> Result<()> {
        if self.inner.storage_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.writer.ensure_event_storage_blocking()?;
        self.inner.storage_ready.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.ensure_storage().await?;
        self.inner.readers.run(f).await
    }

    async fn read_with_cancel<T, F>(&self, f: F, cancel: &CancellationToken) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.read(f) => result,
        }
    }

    pub(crate) fn read_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.ensure_storage_blocking()?;
        self.inner.readers.run_blocking(f)
    }

    fn scoped_identity(&self, stream: StreamIdentity) -> Result<StreamIdentity> {
        stream.ensure_mode(self.identity_mode())?;
        Ok(stream)
    }

    fn scoped_command(&self, mut command: AppendCommand) -> Result<AppendCommand> {
        command.stream.ensure_mode(self.identity_mode())?;
        command.tenant = self.tenant.clone();
        Ok(command)
    }

    // =========================================================================
    // Appends
    // =========================================================================

    /// Serializes a typed event into appendable [`EventData`].
    pub fn event_data<T: DomainEvent>(&self, event: &T) -> Result<EventData> {
        encode_event(self.inner.serializer.as_ref(), event)
    }

    /// Appends to one stream if its version still equals `expected_rev`.
    ///
    /// # Errors
    ///
    /// - `Error::Conflict` if the stream moved on; nothing is written
    /// - `Error::Configuration` if the stream uses the other identity scheme
    pub async fn append(&self, command: AppendCommand) -> Result<AppendResult> {
        let command = self.scoped_command(command)?;
        self.inner.writer.append(command).await
    }

    /// Appends to several streams in one transaction; one conflict fails all.
    pub async fn append_all(&self, commands: Vec<AppendCommand>) -> Result<Vec<AppendResult>> {
        let commands = commands
            .into_iter()
            .map(|c| self.scoped_command(c))
            .collect::<Result<Vec<_>>>()?;
        self.inner.writer.append_all(commands).await
    }

    // =========================================================================
    // Stream Reads
    // =========================================================================

    /// Events of one stream within `opts`, ordered by revision. Empty for an
    /// unknown stream.
    pub async fn fetch_stream(&self, stream: impl Into<StreamIdentity>, opts: FetchOptions) -> Result<Vec<Event>> {
        self.fetch_stream_with_cancel(stream, opts, &CancellationToken::new()).await
    }

    pub async fn fetch_stream_with_cancel(
        &self,
        stream: impl Into<StreamIdentity>,
        opts: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>> {
        let stream = self.scoped_identity(stream.into())?;
        opts.validate()?;
        let (mode, tenant) = (self.identity_mode(), self.tenant.clone());
        self.read_with_cancel(
            move |conn| reader::fetch_stream(conn, mode, &tenant, &stream, &opts),
            cancel,
        )
        .await
    }

    /// Current version of a stream; version 0 when it does not exist.
    pub async fn fetch_stream_state(&self, stream: impl Into<StreamIdentity>) -> Result<StreamState> {
        let stream = self.scoped_identity(stream.into())?;
        let tenant = self.tenant.clone();
        self.read(move |conn| reader::fetch_stream_state(conn, &tenant, &stream))
            .await
    }

    /// Loads one event by id.
    pub async fn load(&self, event_id: Uuid) -> Result<Event> {
        let (mode, tenant) = (self.identity_mode(), self.tenant.clone());
        self.read(move |conn| reader::load_event(conn, mode, &tenant, event_id))
            .await
    }

    /// Loads one event and decodes its payload as `T`.
    ///
    /// Fails with `WrongEventType` when the stored type is not `T::EVENT_TYPE`.
    pub async fn load_typed<T: DomainEvent>(&self, event_id: Uuid) -> Result<TypedEvent<T>> {
        let event = self.load(event_id).await?;
        decode_typed(self.inner.serializer.as_ref(), event)
    }

    /// Folds a stream into an aggregate.
    ///
    /// Returns `None` when `opts` selects no events, even if a seed is given.
    /// Otherwise the result carries the requested stream's identity.
    pub async fn aggregate_stream<A: Aggregate + Default>(
        &self,
        aggregator: &Aggregator<A>,
        stream: impl Into<StreamIdentity>,
        opts: FetchOptions,
        seed: Option<A>,
    ) -> Result<Option<A>> {
        self.aggregate_stream_with_cancel(aggregator, stream, opts, seed, &CancellationToken::new())
            .await
    }

    pub async fn aggregate_stream_with_cancel<A: Aggregate + Default>(
        &self,
        aggregator: &Aggregator<A>,
        stream: impl Into<StreamIdentity>,
        opts: FetchOptions,
        seed: Option<A>,
        cancel: &CancellationToken,
    ) -> Result<Option<A>> {
        let stream = stream.into();
        let events = self.fetch_stream_with_cancel(stream.clone(), opts, cancel).await?;
        if events.is_empty() {
            return Ok(None);
        }
        let built = aggregator
            .build_async(self.inner.serializer.as_ref(), &events, seed, cancel)
            .await?;
        Ok(with_identity(built, &stream))
    }

    // =========================================================================
    // Log Queries
    // =========================================================================

    /// Query over every event of this handle's tenant, in global order.
    pub fn query_all_raw_events(&self) -> RawEventQuery {
        RawEventQuery::new(self.clone())
    }

    /// Query over the payloads of every `T` event of this handle's tenant.
    pub fn query_raw_event_data_only<T: DomainEvent>(&self) -> RawEventDataQuery<T> {
        RawEventDataQuery::new(self.clone())
    }

    /// Highest committed global position.
    pub fn head_position(&self) -> GlobalPos {
        self.inner.notifier.current()
    }

    /// Notifications of new commits.
    pub fn subscribe_head(&self) -> HeadSubscription {
        self.inner.notifier.subscribe()
    }

    // =========================================================================
    // Projected State
    // =========================================================================

    /// Loads the document an aggregation projection keeps for `stream`.
    pub async fn load_document<T>(&self, table: &str, stream: impl Into<StreamIdentity>) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (table, id, tenant) = (table.to_string(), stream.into().storage_key(), self.tenant.clone());
        self.read(move |conn| {
            reader::load_document(conn, &table, &tenant, &id)?
                .map(|doc| serde_json::from_value(doc.data).map_err(Error::from))
                .transpose()
        })
        .await
    }

    /// Every document of this tenant in an aggregation projection's table, ordered by id.
    pub async fn query_documents<T>(&self, table: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (table, tenant) = (table.to_string(), self.tenant.clone());
        self.read(move |conn| {
            reader::query_documents(conn, &table, &tenant)?
                .into_iter()
                .map(|(_, doc)| serde_json::from_value(doc.data).map_err(Error::from))
                .collect()
        })
        .await
    }

    /// One row of a flat table projection, keyed by column name.
    pub async fn read_table_row(
        &self,
        table: &str,
        key_column: &str,
        key: impl Into<SqlValue>,
    ) -> Result<Option<Map<String, JsonValue>>> {
        let (table, key_column, key, tenant) = (
            table.to_string(),
            key_column.to_string(),
            key.into(),
            self.tenant.clone(),
        );
        self.read(move |conn| reader::read_table_row(conn, &table, &key_column, &tenant, &key))
            .await
    }

    /// Every row of this tenant in a flat table projection, ordered by key.
    pub async fn query_table(&self, table: &str, key_column: &str) -> Result<Vec<Map<String, JsonValue>>> {
        let (table, key_column, tenant) = (table.to_string(), key_column.to_string(), self.tenant.clone());
        self.read(move |conn| reader::query_table(conn, &table, &key_column, &tenant))
            .await
    }

    /// Flushes pending appends and stops the writer. Later writes fail with `Closed`.
    pub async fn shutdown(&self) {
        self.inner.writer.shutdown().await;
        tracing::info!(path = %self.inner.path.display(), "event store shut down");
    }
}

/// Stamps the requested stream's identity on an aggregation result.
fn with_identity<A: Aggregate>(built: Option<A>, stream: &StreamIdentity) -> Option<A> {
    built.map(|mut aggregate| {
        aggregate.set_identity(stream);
        aggregate
    })
}

fn decode_typed<T: DomainEvent>(serializer: &dyn Serializer, event: Event) -> Result<TypedEvent<T>> {
    if event.event_type != T::EVENT_TYPE {
        return Err(Error::WrongEventType {
            event_id: event.event_id,
            expected: T::EVENT_TYPE.to_string(),
            actual: event.event_type,
        });
    }
    let data = decode_payload(serializer, &event.data)?;
    Ok(TypedEvent { event, data })
}

// =============================================================================
// Blocking Handle
// =============================================================================

/// Synchronous counterpart of [`EventStore`].
///
/// Must not be used from inside a Tokio runtime.
#[derive(Clone, Debug)]
pub struct BlockingEventStore {
    store: EventStore,
}

impl BlockingEventStore {
    /// Opens a store without an async runtime.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let store = EventStore::open_internal(path.as_ref(), config, Arc::new(JsonSerializer))?;
        Ok(Self { store })
    }

    /// The async handle over the same store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn for_tenant(&self, tenant: impl Into<TenantId>) -> Self {
        Self {
            store: self.store.for_tenant(tenant),
        }
    }

    pub fn event_data<T: DomainEvent>(&self, event: &T) -> Result<EventData> {
        self.store.event_data(event)
    }

    pub fn append(&self, command: AppendCommand) -> Result<AppendResult> {
        let command = self.store.scoped_command(command)?;
        self.store.inner.writer.append_blocking(command)
    }

    pub fn append_all(&self, commands: Vec<AppendCommand>) -> Result<Vec<AppendResult>> {
        let commands = commands
            .into_iter()
            .map(|c| self.store.scoped_command(c))
            .collect::<Result<Vec<_>>>()?;
        self.store.inner.writer.append_all_blocking(commands)
    }

    pub fn fetch_stream(&self, stream: impl Into<StreamIdentity>, opts: FetchOptions) -> Result<Vec<Event>> {
        let stream = self.store.scoped_identity(stream.into())?;
        opts.validate()?;
        let (mode, tenant) = (self.store.identity_mode(), self.store.tenant.clone());
        self.store
            .read_blocking(move |conn| reader::fetch_stream(conn, mode, &tenant, &stream, &opts))
    }

    pub fn fetch_stream_state(&self, stream: impl Into<StreamIdentity>) -> Result<StreamState> {
        let stream = self.store.scoped_identity(stream.into())?;
        let tenant = self.store.tenant.clone();
        self.store
            .read_blocking(move |conn| reader::fetch_stream_state(conn, &tenant, &stream))
    }

    pub fn load(&self, event_id: Uuid) -> Result<Event> {
        let (mode, tenant) = (self.store.identity_mode(), self.store.tenant.clone());
        self.store
            .read_blocking(move |conn| reader::load_event(conn, mode, &tenant, event_id))
    }

    pub fn load_typed<T: DomainEvent>(&self, event_id: Uuid) -> Result<TypedEvent<T>> {
        let event = self.load(event_id)?;
        decode_typed(self.store.inner.serializer.as_ref(), event)
    }

    pub fn aggregate_stream<A: Aggregate + Default>(
        &self,
        aggregator: &Aggregator<A>,
        stream: impl Into<StreamIdentity>,
        opts: FetchOptions,
        seed: Option<A>,
    ) -> Result<Option<A>> {
        let stream = stream.into();
        let events = self.fetch_stream(stream.clone(), opts)?;
        if events.is_empty() {
            return Ok(None);
        }
        let built = aggregator.build(self.store.inner.serializer.as_ref(), &events, seed)?;
        Ok(with_identity(built, &stream))
    }

    pub fn query_all_raw_events(&self) -> RawEventQuery {
        self.store.query_all_raw_events()
    }

    pub fn query_raw_event_data_only<T: DomainEvent>(&self) -> RawEventDataQuery<T> {
        self.store.query_raw_event_data_only()
    }

    pub fn head_position(&self) -> GlobalPos {
        self.store.head_position()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamRev;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Departed {
        port: String,
    }
    impl DomainEvent for Departed {
        const EVENT_TYPE: &'static str = "departed";
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Arrived {
        port: String,
    }
    impl DomainEvent for Arrived {
        const EVENT_TYPE: &'static str = "arrived";
    }

    async fn test_store(config: StoreConfig) -> (EventStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EventStore::open_with(dir.path().join("events.db"), config).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_unknown_stream_is_empty_with_version_zero() {
        let (store, _dir) = test_store(StoreConfig::default()).await;
        let stream = StreamIdentity::new_uuid();

        assert!(store.fetch_stream(stream.clone(), FetchOptions::default()).await.unwrap().is_empty());
        let state = store.fetch_stream_state(stream).await.unwrap();
        assert_eq!(state.version, StreamRev::NONE);
        assert!(!state.exists());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_typed_checks_type() {
        let (store, _dir) = test_store(StoreConfig::default()).await;
        let event = store
            .event_data(&Departed { port: "Oslo".into() })
            .unwrap()
            .with_id(Uuid::new_v4());
        let id = event.event_id.unwrap();

        store
            .append(AppendCommand::new(StreamIdentity::new_uuid(), StreamRev::NONE, vec![event]))
            .await
            .unwrap();

        let typed = store.load_typed::<Departed>(id).await.unwrap();
        assert_eq!(typed.data.port, "Oslo");
        assert_eq!(typed.event.event_id, id);

        assert!(matches!(
            store.load_typed::<Arrived>(id).await,
            Err(Error::WrongEventType { .. })
        ));
        assert!(matches!(
            store.load(Uuid::new_v4()).await,
            Err(Error::EventNotFound(_))
        ));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_scheme_is_enforced() {
        let (store, _dir) = test_store(StoreConfig::default()).await;
        let result = store.fetch_stream("trip-1", FetchOptions::default()).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let (store, _dir) = test_store(StoreConfig::with_string_keys()).await;
        let blue = store.for_tenant("blue");
        let green = store.for_tenant("green");

        let data = blue.event_data(&Departed { port: "Rome".into() }).unwrap();
        blue.append(AppendCommand::new("ship-1", StreamRev::NONE, vec![data.clone()]))
            .await
            .unwrap();
        // Same stream key, other tenant: a separate stream starting at revision 1.
        green
            .append(AppendCommand::new("ship-1", StreamRev::NONE, vec![data]))
            .await
            .unwrap();

        assert_eq!(blue.fetch_stream("ship-1", FetchOptions::default()).await.unwrap().len(), 1);
        assert_eq!(green.fetch_stream_state("ship-1").await.unwrap().version, StreamRev::FIRST);
        assert!(store
            .fetch_stream("ship-1", FetchOptions::default())
            .await
            .unwrap()
            .is_empty());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_fetch_reports_cancelled() {
        let (store, _dir) = test_store(StoreConfig::with_string_keys()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = store
            .fetch_stream_with_cancel("trip-1", FetchOptions::default(), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        store.shutdown().await;
    }

    #[test]
    fn test_blocking_handle() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = BlockingEventStore::open(dir.path().join("events.db"), StoreConfig::with_string_keys()).unwrap();

        let data = store.event_data(&Arrived { port: "Bergen".into() }).unwrap();
        let result = store
            .append(AppendCommand::new("ship-9", StreamRev::NONE, vec![data]))
            .unwrap();
        assert_eq!(result.first_pos, GlobalPos::FIRST);

        let events = store.fetch_stream("ship-9", FetchOptions::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(store.fetch_stream_state("ship-9").unwrap().version, StreamRev::FIRST);
        assert_eq!(store.head_position(), GlobalPos::FIRST);
    }
}
