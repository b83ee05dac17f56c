//! Queries over the raw global log.
//!
//! ```rust,no_run
//! # async fn run(store: spitefold::EventStore) -> spitefold::Result<()> {
//! let recent = store
//!     .query_all_raw_events()
//!     .event_types(["travel"])
//!     .take(100)
//!     .to_list()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Both builders are scoped to the tenant of the store handle that created
//! them and return events in global order.

use std::marker::PhantomData;

use crate::api::EventStore;
use crate::codec::{decode_payload, DomainEvent};
use crate::error::Result;
use crate::reader::{self, LogQuery};
use crate::types::{Event, GlobalPos, StreamIdentity};

/// Builder over every event of one tenant.
#[derive(Debug, Clone)]
pub struct RawEventQuery {
    store: EventStore,
    query: LogQuery,
}

impl RawEventQuery {
    pub(crate) fn new(store: EventStore) -> Self {
        let query = LogQuery {
            tenant: Some(store.tenant().clone()),
            ..LogQuery::default()
        };
        Self { store, query }
    }

    /// Only events of these types.
    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Only events from streams of these types.
    pub fn stream_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.stream_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Only events of one stream.
    pub fn for_stream(mut self, stream: impl Into<StreamIdentity>) -> Self {
        self.query.stream = Some(stream.into());
        self
    }

    /// Only events after `position` (exclusive).
    pub fn after_position(mut self, position: GlobalPos) -> Self {
        self.query.after = position;
        self
    }

    /// Only events at or before `position`.
    pub fn up_to(mut self, position: GlobalPos) -> Self {
        self.query.ceiling = Some(position);
        self
    }

    /// At most `limit` events.
    pub fn take(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// The underlying log query.
    pub fn log_query(&self) -> &LogQuery {
        &self.query
    }

    fn checked(self) -> Result<(EventStore, LogQuery)> {
        if let Some(stream) = &self.query.stream {
            stream.ensure_mode(self.store.identity_mode())?;
        }
        Ok((self.store, self.query))
    }

    pub async fn to_list(self) -> Result<Vec<Event>> {
        let (store, query) = self.checked()?;
        let mode = store.identity_mode();
        store
            .read(move |conn| reader::read_log(conn, mode, &query))
            .await
    }

    /// Number of matching events; `take` is ignored.
    pub async fn count(self) -> Result<u64> {
        let (store, query) = self.checked()?;
        store.read(move |conn| reader::count_log(conn, &query)).await
    }

    /// Blocking form of [`to_list`](Self::to_list).
    pub fn to_list_blocking(self) -> Result<Vec<Event>> {
        let (store, query) = self.checked()?;
        let mode = store.identity_mode();
        store.read_blocking(move |conn| reader::read_log(conn, mode, &query))
    }

    /// Blocking form of [`count`](Self::count).
    pub fn count_blocking(self) -> Result<u64> {
        let (store, query) = self.checked()?;
        store.read_blocking(move |conn| reader::count_log(conn, &query))
    }
}

/// Builder over the decoded payloads of every `T` event of one tenant.
#[derive(Debug, Clone)]
pub struct RawEventDataQuery<T> {
    inner: RawEventQuery,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DomainEvent> RawEventDataQuery<T> {
    pub(crate) fn new(store: EventStore) -> Self {
        Self {
            inner: RawEventQuery::new(store).event_types([T::EVENT_TYPE]),
            _marker: PhantomData,
        }
    }

    pub fn for_stream(mut self, stream: impl Into<StreamIdentity>) -> Self {
        self.inner = self.inner.for_stream(stream);
        self
    }

    pub fn after_position(mut self, position: GlobalPos) -> Self {
        self.inner = self.inner.after_position(position);
        self
    }

    pub fn take(mut self, limit: usize) -> Self {
        self.inner = self.inner.take(limit);
        self
    }

    pub async fn to_list(self) -> Result<Vec<T>> {
        let serializer = self.inner.store.serializer();
        self.inner
            .to_list()
            .await?
            .iter()
            .map(|event| decode_payload(serializer.as_ref(), &event.data))
            .collect()
    }

    pub fn to_list_blocking(self) -> Result<Vec<T>> {
        let serializer = self.inner.store.serializer();
        self.inner
            .to_list_blocking()?
            .iter()
            .map(|event| decode_payload(serializer.as_ref(), &event.data))
            .collect()
    }

    pub async fn count(self) -> Result<u64> {
        self.inner.count().await
    }
}
