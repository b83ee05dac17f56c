//! Per-daemon registry of shard state and progress.
//!
//! Each shard owns a `watch` channel holding its latest [`ShardStatus`]. Shard
//! tasks publish after every committed page and on every state change;
//! waiters park on the channel until the status satisfies them.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::projection::shard::{ShardName, ShardState};
use crate::types::GlobalPos;

/// Latest known status of one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardStatus {
    pub state: ShardState,
    /// Highest global position the shard has durably processed.
    pub last_seen: GlobalPos,
    /// Last unexpected error, kept while the shard is faulted.
    pub error: Option<String>,
}

impl ShardStatus {
    fn stopped(last_seen: GlobalPos) -> Self {
        Self {
            state: ShardState::Stopped,
            last_seen,
            error: None,
        }
    }
}

/// Progress registry owned by a [`ProjectionDaemon`](crate::ProjectionDaemon).
#[derive(Debug, Default)]
pub struct ShardStateTracker {
    shards: Mutex<HashMap<String, watch::Sender<ShardStatus>>>,
}

impl ShardStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_shard<T>(&self, shard: &str, f: impl FnOnce(&watch::Sender<ShardStatus>) -> T) -> Result<T> {
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards
            .get(shard)
            .map(f)
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))
    }

    /// Adds a shard in the `Stopped` state. Re-registering keeps the existing entry.
    pub(crate) fn register(&self, shard: &ShardName, last_seen: GlobalPos) {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards
            .entry(shard.to_string())
            .or_insert_with(|| watch::channel(ShardStatus::stopped(last_seen)).0);
    }

    pub(crate) fn set_state(&self, shard: &ShardName, state: ShardState) {
        let _ = self.with_shard(&shard.to_string(), |tx| {
            tx.send_if_modified(|status| {
                let changed = status.state != state;
                status.state = state;
                if state != ShardState::Faulted {
                    status.error = None;
                }
                changed
            });
        });
    }

    /// Records durable progress; positions never move backwards here.
    pub(crate) fn record_progress(&self, shard: &ShardName, last_seen: GlobalPos) {
        let _ = self.with_shard(&shard.to_string(), |tx| {
            tx.send_if_modified(|status| {
                if last_seen > status.last_seen {
                    status.last_seen = last_seen;
                    true
                } else {
                    false
                }
            });
        });
    }

    /// Overwrites progress, used when a rebuild swaps in new state.
    pub(crate) fn reset_progress(&self, shard: &ShardName, last_seen: GlobalPos) {
        let _ = self.with_shard(&shard.to_string(), |tx| {
            tx.send_modify(|status| status.last_seen = last_seen);
        });
    }

    pub(crate) fn fault(&self, shard: &ShardName, reason: String) {
        let _ = self.with_shard(&shard.to_string(), |tx| {
            tx.send_modify(|status| {
                status.state = ShardState::Faulted;
                status.error = Some(reason);
            });
        });
    }

    /// Current status of a shard.
    pub fn status(&self, shard: &str) -> Result<ShardStatus> {
        self.with_shard(shard, |tx| tx.borrow().clone())
    }

    /// Status of every registered shard, sorted by name.
    pub fn all(&self) -> Vec<(String, ShardStatus)> {
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = shards
            .iter()
            .map(|(name, tx)| (name.clone(), tx.borrow().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Watches a shard's status.
    pub fn subscribe(&self, shard: &str) -> Result<watch::Receiver<ShardStatus>> {
        self.with_shard(shard, |tx| tx.subscribe())
    }

    /// Waits until `shard` has processed up to `target` (a global position,
    /// which equals the event count for a log written from empty).
    ///
    /// Fails with `Timeout` when `timeout` elapses first and with
    /// `ShardFaulted` if the shard faults before getting there.
    pub async fn wait_for_shard_state(&self, shard: &str, target: u64, timeout: Duration) -> Result<ShardStatus> {
        let mut rx = self.subscribe(shard)?;

        let reached = |status: &ShardStatus| {
            status.last_seen.as_raw() >= target || status.state == ShardState::Faulted
        };

        let outcome = tokio::time::timeout(timeout, rx.wait_for(reached))
            .await
            .map(|waited| waited.map(|status| status.clone()));

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => return Err(Error::Closed(format!("tracker for shard '{}' dropped", shard))),
            Err(_) => {
                let reached = rx.borrow().last_seen.as_raw();
                return Err(Error::Timeout {
                    shard: shard.to_string(),
                    target,
                    reached,
                });
            }
        };

        if status.last_seen.as_raw() < target {
            return Err(Error::ShardFaulted {
                shard: shard.to_string(),
                reason: status.error.unwrap_or_default(),
            });
        }
        Ok(status)
    }
}
