//! The task that runs one shard.
//!
//! ```text
//!            ┌──────────────────────── loop ─────────────────────────┐
//!            ▼                                                       │
//! Starting ─► Running ─► read page ─► apply ─► commit(ops + cursor) ─┘
//!               │            │
//!               │            └─ nothing new: wait for head / poll / pause / cancel
//!               │
//!               ├─ transient error: back off and retry the same page
//!               └─ N unexpected errors in a row: Faulted
//! ```
//!
//! Cancellation is checked between pages, so a page is either fully
//! committed or never started.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::EventStore;
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::projection::filter::EventFilter;
use crate::projection::shard::{ShardName, ShardState};
use crate::projection::tracker::ShardStateTracker;
use crate::projection::{ApplyContext, Projection, ShardDefinition, TableTarget};
use crate::reader;
use crate::storage::{self, PageCommit, ProgressUpdate, ProjectionOp};
use crate::types::GlobalPos;

/// The writes computed for one page and the cursor they move to.
#[derive(Debug)]
pub(crate) struct Page {
    pub ops: Vec<ProjectionOp>,
    /// Highest position examined. A short page examines up to the head, so
    /// filtered-out events never hold the cursor back.
    pub last_seen: GlobalPos,
    pub events: usize,
}

/// Reads and applies the page after `after` on a reader thread.
///
/// `ceiling` bounds the page; `None` uses the head at read time.
pub(crate) async fn read_page(
    store: &EventStore,
    projection: &Arc<dyn Projection>,
    filter: &EventFilter,
    after: GlobalPos,
    ceiling: Option<GlobalPos>,
    batch_size: usize,
    target: TableTarget,
) -> Result<Page> {
    let projection = Arc::clone(projection);
    let serializer = store.serializer();
    let mode = store.identity_mode();
    let filter = filter.clone();

    store
        .readers()
        .run(move |conn| {
            let head = match ceiling {
                Some(ceiling) => ceiling,
                None => reader::head_position(conn)?,
            };
            if head <= after {
                return Ok(Page {
                    ops: Vec::new(),
                    last_seen: after,
                    events: 0,
                });
            }

            let events = reader::read_log(conn, mode, &filter.page_query(after, head, batch_size))?;
            debug_assert!(events.iter().all(|e| filter.matches(e)), "page query leaked a filtered event");
            let full = events.len() >= batch_size;
            let last_seen = match events.last() {
                Some(last) if full => last.global_pos,
                _ => head,
            };

            let ctx = ApplyContext {
                conn,
                serializer: serializer.as_ref(),
                target,
            };
            let ops = projection.apply(&ctx, &events)?;

            Ok(Page {
                ops,
                last_seen,
                events: events.len(),
            })
        })
        .await
}

enum Step {
    Advanced,
    Idle,
}

/// Runs one shard until cancelled or faulted.
pub(crate) struct ShardAgent {
    pub store: EventStore,
    pub projection: Arc<dyn Projection>,
    pub shard: ShardDefinition,
    pub tracker: Arc<ShardStateTracker>,
    pub config: DaemonConfig,
}

impl ShardAgent {
    fn name(&self) -> &ShardName {
        &self.shard.name
    }

    pub(crate) async fn run(self, cancel: CancellationToken, mut paused: watch::Receiver<bool>) {
        let shard = self.name().to_string();
        self.tracker.set_state(self.name(), ShardState::Starting);

        let mut last_seen = match self.load_progress(&shard).await {
            Ok(pos) => pos,
            Err(err) => {
                tracing::error!(shard = %shard, error = %err, "failed to load shard progress");
                self.tracker.fault(self.name(), err.to_string());
                return;
            }
        };
        self.tracker.record_progress(self.name(), last_seen);
        self.tracker.set_state(self.name(), ShardState::Running);
        tracing::info!(shard = %shard, last_seen = %last_seen, "shard started");

        let mut heads = self.store.subscribe_head();
        let mut attempt: u32 = 0;
        let mut unexpected: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if *paused.borrow() {
                self.tracker.set_state(self.name(), ShardState::Paused);
                tracing::debug!(shard = %shard, "shard paused");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    resumed = paused.wait_for(|p| !*p) => {
                        if resumed.is_err() {
                            break;
                        }
                    }
                }
                self.tracker.set_state(self.name(), ShardState::Running);
                tracing::debug!(shard = %shard, "shard resumed");
                continue;
            }

            match self.step(&shard, &mut last_seen).await {
                Ok(Step::Advanced) => {
                    attempt = 0;
                    unexpected = 0;
                }
                Ok(Step::Idle) => {
                    attempt = 0;
                    unexpected = 0;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        woke = heads.wait_beyond(last_seen, &cancel) => {
                            if let Err(Error::Closed(_)) = woke {
                                tracing::debug!(shard = %shard, "event store closed; stopping shard");
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = paused.changed() => {
                            if changed.is_err() {
                                tracing::debug!(shard = %shard, "daemon dropped; stopping shard");
                                break;
                            }
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    let delay = self.config.retry_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(shard = %shard, error = %err, attempt, ?delay, "transient shard error; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    unexpected += 1;
                    if unexpected >= self.config.max_unexpected_failures {
                        tracing::error!(shard = %shard, error = %err, failures = unexpected, "shard faulted");
                        self.tracker.fault(self.name(), err.to_string());
                        return;
                    }
                    let delay = self.config.retry_delay(unexpected - 1);
                    tracing::warn!(shard = %shard, error = %err, failures = unexpected, "shard page failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.tracker.set_state(self.name(), ShardState::Stopping);
        self.tracker.set_state(self.name(), ShardState::Stopped);
        tracing::info!(shard = %shard, last_seen = %last_seen, "shard stopped");
    }

    async fn load_progress(&self, shard: &str) -> Result<GlobalPos> {
        let shard = shard.to_string();
        self.store
            .readers()
            .run(move |conn| storage::load_progress(conn, &shard))
            .await
    }

    async fn step(&self, shard: &str, last_seen: &mut GlobalPos) -> Result<Step> {
        let page = read_page(
            &self.store,
            &self.projection,
            &self.shard.filter,
            *last_seen,
            None,
            self.config.batch_size,
            TableTarget::Live,
        )
        .await?;

        if page.last_seen <= *last_seen {
            return Ok(Step::Idle);
        }

        let op_count = page.ops.len();
        self.store
            .writer()
            .commit_page(PageCommit {
                ops: page.ops,
                progress: Some(ProgressUpdate {
                    shard: shard.to_string(),
                    previous: *last_seen,
                    last_seen: page.last_seen,
                }),
            })
            .await?;

        tracing::trace!(
            shard = %shard,
            from = %last_seen,
            to = %page.last_seen,
            events = page.events,
            ops = op_count,
            "page committed"
        );

        *last_seen = page.last_seen;
        self.tracker.record_progress(self.name(), page.last_seen);
        Ok(Step::Advanced)
    }
}
