//! # Append Notifications
//!
//! The writer publishes the log head after every committed batch. Shards and
//! other tailers subscribe to that head instead of polling the database on a
//! tight loop.
//!
//! ```text
//! writer thread                         shard tasks
//! ┌────────────┐  publish(head)   ┌────────────────────────┐
//! │ COMMIT     │ ───────────────► │ watch::Receiver<head>  │ ─► read next page
//! └────────────┘                  └────────────────────────┘
//! ```
//!
//! ## Why `watch` and not `broadcast`?
//!
//! Tailers only need to know *that* the head moved past what they have seen;
//! they re-read the log themselves. A `watch` channel keeps one value, never
//! lags and costs nothing when nobody listens.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::GlobalPos;

/// Publishes the highest committed global position.
#[derive(Debug, Clone)]
pub struct HeadNotifier {
    tx: Arc<watch::Sender<GlobalPos>>,
}

impl HeadNotifier {
    /// Creates a notifier starting at `head`.
    pub fn new(head: GlobalPos) -> Self {
        let (tx, _rx) = watch::channel(head);
        Self { tx: Arc::new(tx) }
    }

    /// Advances the head. Positions at or below the current head are ignored.
    pub fn publish(&self, head: GlobalPos) {
        self.tx.send_if_modified(|current| {
            if head > *current {
                *current = head;
                true
            } else {
                false
            }
        });
    }

    /// The last published head.
    pub fn current(&self) -> GlobalPos {
        *self.tx.borrow()
    }

    /// Returns a subscription that observes future heads.
    pub fn subscribe(&self) -> HeadSubscription {
        HeadSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of a [`HeadNotifier`].
#[derive(Debug, Clone)]
pub struct HeadSubscription {
    rx: watch::Receiver<GlobalPos>,
}

impl HeadSubscription {
    /// The most recently published head.
    pub fn current(&self) -> GlobalPos {
        *self.rx.borrow()
    }

    /// Waits until the head moves beyond `seen`.
    ///
    /// Returns immediately if it already has. Fails with `Cancelled` when the
    /// token fires and with `Closed` when the writer is gone.
    pub async fn wait_beyond(&mut self, seen: GlobalPos, cancel: &CancellationToken) -> Result<GlobalPos> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            head = self.rx.wait_for(|head| *head > seen) => head
                .map(|head| *head)
                .map_err(|_| Error::Closed("head notifier dropped".to_string())),
        }
    }

    /// Waits for the next publish, whatever its value.
    pub async fn changed(&mut self) -> Result<GlobalPos> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Closed("head notifier dropped".to_string()))?;
        Ok(*self.rx.borrow_and_update())
    }
}
