//! # Live Aggregation
//!
//! An [`Aggregator`] folds the events of one stream into a typed read model.
//! Handlers are registered per event type when the aggregator is built, so
//! the fold itself is a map lookup per event:
//!
//! ```text
//! events ──► [type tag] ──► handler registry ──► create(e) | apply(&mut a, e)
//!                                   │
//!                                   └─ no handler: skipped (or an error in strict mode)
//! ```
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use spitefold::{Aggregate, Aggregator, DomainEvent, StreamIdentity};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Travel { day: u32, distance: f64 }
//! impl DomainEvent for Travel { const EVENT_TYPE: &'static str = "travel"; }
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Trip { id: String, days: u32, total: f64 }
//!
//! impl Aggregate for Trip {
//!     fn set_identity(&mut self, identity: &StreamIdentity) {
//!         self.id = identity.to_string();
//!     }
//! }
//!
//! let aggregator = Aggregator::<Trip>::new().apply(|trip: &mut Trip, e: &Travel, _| {
//!     trip.days = trip.days.max(e.day);
//!     trip.total += e.distance;
//! });
//! assert_eq!(aggregator.handled_event_types(), vec!["travel".to_string()]);
//! ```

use std::collections::HashMap;
use std::fmt;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::codec::{DomainEvent, Serializer};
use crate::error::{Error, Result};
use crate::types::{Event, StreamIdentity};

/// Events folded between cancellation checks in [`Aggregator::build_async`].
const ASYNC_CHUNK_SIZE: usize = 256;

/// A read model built from one stream.
pub trait Aggregate: Send + Sync + 'static {
    /// Receives the stream's identity after every build.
    fn set_identity(&mut self, identity: &StreamIdentity);
}

type CreateFn<A> = Box<dyn Fn(&JsonValue, &Event) -> Result<A> + Send + Sync>;
type ApplyFn<A> = Box<dyn Fn(&mut A, &JsonValue, &Event) -> Result<()> + Send + Sync>;

struct HandlerEntry<A> {
    create: Option<CreateFn<A>>,
    apply: Option<ApplyFn<A>>,
    ignored: bool,
}

impl<A> Default for HandlerEntry<A> {
    fn default() -> Self {
        Self {
            create: None,
            apply: None,
            ignored: false,
        }
    }
}

/// Handler registry that folds events into `A`.
pub struct Aggregator<A> {
    handlers: HashMap<String, HandlerEntry<A>>,
    strict: bool,
}

impl<A> fmt::Debug for Aggregator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("strict", &self.strict)
            .finish()
    }
}

impl<A: Aggregate + Default> Default for Aggregator<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate + Default> Aggregator<A> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            strict: false,
        }
    }

    /// Registers how `E` creates the aggregate when there is no state yet.
    pub fn create<E, F>(mut self, f: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&E, &Event) -> A + Send + Sync + 'static,
    {
        let create: CreateFn<A> = Box::new(move |payload, event| Ok(f(&E::deserialize(payload)?, event)));
        self.handlers.entry(E::EVENT_TYPE.to_string()).or_default().create = Some(create);
        self
    }

    /// Registers how `E` changes existing state.
    ///
    /// Without a `create` handler the first event applies to `A::default()`.
    pub fn apply<E, F>(mut self, f: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&mut A, &E, &Event) + Send + Sync + 'static,
    {
        let apply: ApplyFn<A> = Box::new(move |state, payload, event| {
            f(state, &E::deserialize(payload)?, event);
            Ok(())
        });
        self.handlers.entry(E::EVENT_TYPE.to_string()).or_default().apply = Some(apply);
        self
    }

    /// Declares that `E` is deliberately not handled.
    pub fn ignore<E: DomainEvent>(mut self) -> Self {
        self.handlers.entry(E::EVENT_TYPE.to_string()).or_default().ignored = true;
        self
    }

    /// Fails the build on event types that are neither handled nor ignored.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// True if `event_type` has a create or apply handler.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers
            .get(event_type)
            .is_some_and(|entry| !entry.ignored && (entry.create.is_some() || entry.apply.is_some()))
    }

    /// Event types with a create or apply handler, sorted.
    pub fn handled_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .keys()
            .filter(|t| self.handles(t))
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Folds `events` (one stream, in revision order) into `seed`.
    ///
    /// Returns `None` when nothing was handled and there was no seed. The
    /// result's identity is set from the events' stream.
    pub fn build(&self, serializer: &dyn Serializer, events: &[Event], seed: Option<A>) -> Result<Option<A>> {
        let state = self.fold(serializer, seed, events)?;
        Ok(self.finish(state, events))
    }

    /// Same as [`build`](Self::build), yielding between chunks and stopping
    /// with `Cancelled` when `cancel` fires.
    pub async fn build_async(
        &self,
        serializer: &dyn Serializer,
        events: &[Event],
        seed: Option<A>,
        cancel: &CancellationToken,
    ) -> Result<Option<A>> {
        let mut state = seed;
        for chunk in events.chunks(ASYNC_CHUNK_SIZE) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            state = self.fold(serializer, state, chunk)?;
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.finish(state, events))
    }

    fn fold(&self, serializer: &dyn Serializer, mut state: Option<A>, events: &[Event]) -> Result<Option<A>> {
        for event in events {
            let Some(entry) = self.handlers.get(&event.event_type) else {
                if self.strict {
                    return Err(Error::Configuration(format!(
                        "no handler registered for event type '{}'",
                        event.event_type
                    )));
                }
                tracing::trace!(event_type = %event.event_type, event_id = %event.event_id, "skipping unhandled event");
                continue;
            };
            if entry.ignored {
                continue;
            }

            let payload = serializer.from_bytes(&event.data)?;
            state = match (state, &entry.create, &entry.apply) {
                (None, Some(create), _) => Some(create(&payload, event)?),
                (None, None, Some(apply)) => {
                    let mut fresh = A::default();
                    apply(&mut fresh, &payload, event)?;
                    Some(fresh)
                }
                (Some(mut current), _, Some(apply)) => {
                    apply(&mut current, &payload, event)?;
                    Some(current)
                }
                (current, _, _) => current,
            };
        }
        Ok(state)
    }

    fn finish(&self, mut state: Option<A>, events: &[Event]) -> Option<A> {
        if let (Some(aggregate), Some(last)) = (state.as_mut(), events.last()) {
            aggregate.set_identity(&last.stream);
        }
        state
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerializer;
    use crate::types::{GlobalPos, StreamRev, TenantId};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Opened {
        limit: i64,
    }
    impl DomainEvent for Opened {
        const EVENT_TYPE: &'static str = "opened";
    }

    #[derive(Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }
    impl DomainEvent for Deposited {
        const EVENT_TYPE: &'static str = "deposited";
    }

    #[derive(Serialize, Deserialize)]
    struct Audited;
    impl DomainEvent for Audited {
        const EVENT_TYPE: &'static str = "audited";
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Account {
        id: Option<StreamIdentity>,
        limit: i64,
        balance: i64,
        deposits: u32,
    }

    impl Aggregate for Account {
        fn set_identity(&mut self, identity: &StreamIdentity) {
            self.id = Some(identity.clone());
        }
    }

    fn aggregator() -> Aggregator<Account> {
        Aggregator::new()
            .create(|e: &Opened, _| Account {
                limit: e.limit,
                ..Account::default()
            })
            .apply(|a: &mut Account, e: &Deposited, _| {
                a.balance += e.amount;
                a.deposits += 1;
            })
    }

    fn events(stream: &str, payloads: &[(&str, serde_json::Value)]) -> Vec<Event> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, (event_type, data))| Event {
                event_id: uuid::Uuid::new_v4(),
                global_pos: GlobalPos::from_raw(i as u64 + 1),
                stream: StreamIdentity::key(stream),
                stream_rev: StreamRev::from_raw(i as u64 + 1),
                event_type: event_type.to_string(),
                stream_type: None,
                timestamp_ms: 0,
                tenant: TenantId::default(),
                data: serde_json::to_vec(data).unwrap(),
                metadata: None,
            })
            .collect()
    }

    fn history() -> Vec<Event> {
        events(
            "acct-1",
            &[
                ("opened", serde_json::json!({"limit": 100})),
                ("deposited", serde_json::json!({"amount": 10})),
                ("renamed", serde_json::json!({"name": "x"})),
                ("deposited", serde_json::json!({"amount": 5})),
            ],
        )
    }

    #[test]
    fn test_build_folds_and_sets_identity() {
        let account = aggregator().build(&JsonSerializer, &history(), None).unwrap().unwrap();

        assert_eq!(account.limit, 100);
        assert_eq!(account.balance, 15);
        assert_eq!(account.deposits, 2);
        assert_eq!(account.id, Some(StreamIdentity::key("acct-1")));
    }

    #[test]
    fn test_empty_without_seed_is_none() {
        assert!(aggregator().build(&JsonSerializer, &[], None).unwrap().is_none());

        let seed = Account {
            balance: 3,
            ..Account::default()
        };
        let built = aggregator().build(&JsonSerializer, &[], Some(seed.clone())).unwrap();
        assert_eq!(built, Some(seed));
    }

    #[test]
    fn test_split_build_matches_full_build() {
        let all = history();
        let full = aggregator().build(&JsonSerializer, &all, None).unwrap();

        for k in 0..=all.len() {
            let partial = aggregator().build(&JsonSerializer, &all[..k], None).unwrap();
            let resumed = aggregator().build(&JsonSerializer, &all[k..], partial).unwrap();
            assert_eq!(resumed, full, "split at {k}");
        }
    }

    #[test]
    fn test_apply_without_create_starts_from_default() {
        let deposits = events("acct-2", &[("deposited", serde_json::json!({"amount": 7}))]);
        let account = aggregator().build(&JsonSerializer, &deposits, None).unwrap().unwrap();
        assert_eq!(account.balance, 7);
        assert_eq!(account.limit, 0);
    }

    #[test]
    fn test_strict_mode_rejects_undeclared_events() {
        let strict = aggregator().ignore::<Audited>().strict();
        assert!(matches!(
            strict.build(&JsonSerializer, &history(), None),
            Err(Error::Configuration(_))
        ));

        let audited = events(
            "acct-3",
            &[
                ("opened", serde_json::json!({"limit": 1})),
                ("audited", serde_json::json!(null)),
            ],
        );
        assert!(strict.build(&JsonSerializer, &audited, None).unwrap().is_some());
        assert_eq!(strict.handled_event_types(), vec!["deposited", "opened"]);
    }

    #[test]
    fn test_bad_payload_is_an_error() {
        let broken = events("acct-4", &[("deposited", serde_json::json!({"amount": "lots"}))]);
        assert!(matches!(
            aggregator().build(&JsonSerializer, &broken, None),
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_build_async_matches_and_cancels() {
        let all = history();
        let cancel = CancellationToken::new();

        let built = aggregator().build_async(&JsonSerializer, &all, None, &cancel).await.unwrap();
        assert_eq!(built, aggregator().build(&JsonSerializer, &all, None).unwrap());

        cancel.cancel();
        let cancelled = aggregator().build_async(&JsonSerializer, &all, None, &cancel).await;
        assert!(matches!(cancelled, Err(Error::Cancelled)));
    }
}
