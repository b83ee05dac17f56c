//! # Projection Daemon
//!
//! Owns the projections registered with it, one task per running shard, and
//! the [`ShardStateTracker`] those tasks report to. Nothing here is global:
//! two daemons over two stores never see each other.
//!
//! ## Rebuild
//!
//! ```text
//! stop shards ──► create <table>__rebuild ──► replay log up to head H into shadow
//!                                                    │
//!                      ┌─────────── ok ──────────────┴──── error / cancelled ─────┐
//!                      ▼                                                          ▼
//!  one transaction: drop live, rename shadow, cursors = H              drop shadow tables
//!                      │                                                          │
//!                      └──────────────► restart shards that were running ◄────────┘
//! ```
//!
//! Readers see either the old tables or the fully rebuilt ones. While a
//! projection rebuilds, its shards cannot be started.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::EventStore;
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::projection::agent::{read_page, ShardAgent};
use crate::projection::shard::{ShardName, ShardState};
use crate::projection::tracker::{ShardStateTracker, ShardStatus};
use crate::projection::{Projection, ShardDefinition, TableTarget};
use crate::storage::{self, PageCommit};
use crate::types::GlobalPos;

struct ShardTask {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Registered {
    projection: Arc<dyn Projection>,
    shards: Vec<ShardDefinition>,
}

struct DaemonInner {
    store: EventStore,
    config: DaemonConfig,
    tracker: Arc<ShardStateTracker>,
    projections: Mutex<BTreeMap<String, Arc<Registered>>>,
    tasks: Mutex<HashMap<String, ShardTask>>,
    rebuilding: Mutex<HashSet<String>>,
}

/// Runs asynchronous projections against one [`EventStore`].
///
/// Cheap to clone; clones share shards and tracker.
#[derive(Clone)]
pub struct ProjectionDaemon {
    inner: Arc<DaemonInner>,
}

impl std::fmt::Debug for ProjectionDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDaemon")
            .field("projections", &self.projections())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProjectionDaemon {
    pub fn new(store: EventStore, config: DaemonConfig) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                store,
                config,
                tracker: Arc::new(ShardStateTracker::new()),
                projections: Mutex::new(BTreeMap::new()),
                tasks: Mutex::new(HashMap::new()),
                rebuilding: Mutex::new(HashSet::new()),
            }),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers a projection: validates it, creates its tables and loads
    /// each shard's persisted progress. Shards stay stopped.
    pub async fn add_projection<P: Projection>(&self, projection: P) -> Result<()> {
        let projection: Arc<dyn Projection> = Arc::new(projection);
        let name = projection.name().to_string();

        projection.validate()?;
        let shards = projection.shards();
        if shards.is_empty() {
            return Err(Error::Configuration(format!("projection '{}' declares no shards", name)));
        }

        let mut seen = HashSet::new();
        for shard in &shards {
            let shard_name = shard.name.to_string();
            if shard.name.projection() != name {
                return Err(Error::Configuration(format!(
                    "shard '{}' does not belong to projection '{}'",
                    shard_name, name
                )));
            }
            if !seen.insert(shard_name.clone()) {
                return Err(Error::Configuration(format!("shard '{}' declared twice", shard_name)));
            }
            shard.filter.validate(&shard_name)?;
        }

        let tables = projection.tables();
        for table in &tables {
            table.validate()?;
        }
        self.ensure_not_registered(&name)?;

        let store = &self.inner.store;
        store.ensure_storage().await?;
        store
            .writer()
            .ensure_tables(tables.iter().map(|t| (t.clone(), t.name().to_string())).collect())
            .await?;

        let shard_names: Vec<String> = shards.iter().map(|s| s.name.to_string()).collect();
        let progress = store
            .readers()
            .run(move |conn| {
                shard_names
                    .iter()
                    .map(|shard| storage::load_progress(conn, shard))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

        {
            let mut projections = lock(&self.inner.projections);
            if projections.contains_key(&name) {
                return Err(Error::Configuration(format!("projection '{}' is already registered", name)));
            }
            for (shard, last_seen) in shards.iter().zip(progress) {
                self.inner.tracker.register(&shard.name, last_seen);
            }
            projections.insert(name.clone(), Arc::new(Registered { projection, shards }));
        }

        tracing::info!(projection = %name, "projection registered");
        Ok(())
    }

    fn ensure_not_registered(&self, name: &str) -> Result<()> {
        if lock(&self.inner.projections).contains_key(name) {
            return Err(Error::Configuration(format!("projection '{}' is already registered", name)));
        }
        Ok(())
    }

    fn registered(&self, projection: &str) -> Result<Arc<Registered>> {
        lock(&self.inner.projections)
            .get(projection)
            .cloned()
            .ok_or_else(|| Error::ProjectionNotFound(projection.to_string()))
    }

    fn shard_definition(&self, shard: &str) -> Result<(Arc<Registered>, ShardDefinition)> {
        let name = ShardName::parse(shard)?;
        let registered = self
            .registered(name.projection())
            .map_err(|_| Error::ShardNotFound(shard.to_string()))?;
        let definition = registered
            .shards
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;
        Ok((registered, definition))
    }

    /// Registered projection names, sorted.
    pub fn projections(&self) -> Vec<String> {
        lock(&self.inner.projections).keys().cloned().collect()
    }

    /// Every registered shard with the filter it consumes, sorted by name.
    pub fn shards(&self) -> Vec<ShardDefinition> {
        let mut shards: Vec<ShardDefinition> = lock(&self.inner.projections)
            .values()
            .flat_map(|r| r.shards.iter().cloned())
            .collect();
        shards.sort_by_key(|s| s.name.to_string());
        shards
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts every registered shard.
    pub async fn start_all(&self) -> Result<()> {
        for shard in self.shards() {
            self.start_shard(&shard.name.to_string()).await?;
        }
        Ok(())
    }

    /// Starts one shard. Starting a running shard does nothing.
    pub async fn start_shard(&self, shard: &str) -> Result<()> {
        let (registered, definition) = self.shard_definition(shard)?;
        self.inner.store.ensure_storage().await?;

        // Rebuild marks projections while holding the tasks lock too.
        let mut tasks = lock(&self.inner.tasks);
        if lock(&self.inner.rebuilding).contains(definition.name.projection()) {
            return Err(Error::RebuildInProgress(definition.name.projection().to_string()));
        }
        if let Some(task) = tasks.get(shard) {
            if !task.handle.is_finished() {
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let (paused, paused_rx) = watch::channel(false);
        let agent = ShardAgent {
            store: self.inner.store.clone(),
            projection: Arc::clone(&registered.projection),
            shard: definition,
            tracker: Arc::clone(&self.inner.tracker),
            config: self.inner.config.clone(),
        };
        let handle = tokio::spawn(agent.run(cancel.clone(), paused_rx));

        tasks.insert(shard.to_string(), ShardTask { cancel, paused, handle });
        Ok(())
    }

    fn running_task<T>(&self, shard: &str, f: impl FnOnce(&ShardTask) -> T) -> Result<Option<T>> {
        self.shard_definition(shard)?;
        Ok(lock(&self.inner.tasks)
            .get(shard)
            .filter(|task| !task.handle.is_finished())
            .map(f))
    }

    /// Pauses a running shard after its in-flight page. No-op if it is not running.
    pub fn pause_shard(&self, shard: &str) -> Result<()> {
        self.running_task(shard, |task| {
            task.paused.send_replace(true);
        })?;
        Ok(())
    }

    pub fn resume_shard(&self, shard: &str) -> Result<()> {
        self.running_task(shard, |task| {
            task.paused.send_replace(false);
        })?;
        Ok(())
    }

    /// Stops a shard after its in-flight page, aborting it if that takes
    /// longer than the configured stop timeout.
    pub async fn stop_shard(&self, shard: &str) -> Result<()> {
        let (_, definition) = self.shard_definition(shard)?;
        let Some(task) = lock(&self.inner.tasks).remove(shard) else {
            return Ok(());
        };

        task.cancel.cancel();
        let mut handle = task.handle;
        if tokio::time::timeout(self.inner.config.stop_timeout, &mut handle).await.is_err() {
            tracing::warn!(shard = %shard, timeout = ?self.inner.config.stop_timeout, "shard did not stop in time; aborting");
            handle.abort();
            self.inner.tracker.set_state(&definition.name, ShardState::Stopped);
        }
        Ok(())
    }

    /// Gracefully stops every running shard.
    pub async fn stop_all(&self) -> Result<()> {
        let running: Vec<String> = lock(&self.inner.tasks).keys().cloned().collect();
        futures::future::try_join_all(running.iter().map(|shard| self.stop_shard(shard))).await?;
        Ok(())
    }

    /// Aborts every shard task immediately. Uncommitted pages are discarded
    /// and replayed on the next start.
    pub fn kill_all(&self) {
        let tasks: Vec<(String, ShardTask)> = lock(&self.inner.tasks).drain().collect();
        for (shard, task) in tasks {
            task.cancel.cancel();
            task.handle.abort();
            if let Ok(name) = ShardName::parse(&shard) {
                self.inner.tracker.set_state(&name, ShardState::Stopped);
            }
        }
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// The tracker shards of this daemon report to.
    pub fn tracker(&self) -> &ShardStateTracker {
        &self.inner.tracker
    }

    pub fn shard_state(&self, shard: &str) -> Result<ShardState> {
        Ok(self.inner.tracker.status(shard)?.state)
    }

    /// State, progress and last error of a shard.
    pub fn shard_status(&self, shard: &str) -> Result<ShardStatus> {
        self.inner.tracker.status(shard)
    }

    /// Waits until `shard` has processed up to global position `target`.
    pub async fn wait_for_shard_state(&self, shard: &str, target: u64, timeout: Duration) -> Result<ShardStatus> {
        self.inner.tracker.wait_for_shard_state(shard, target, timeout).await
    }

    /// Waits until every shard has caught up with the head as of this call.
    pub async fn wait_for_non_stale_data(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let head = self.inner.store.head_position();

        for shard in self.shards() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.wait_for_shard_state(&shard.name.to_string(), head.as_raw(), remaining)
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Rebuilds a projection from the start of the log.
    ///
    /// On success the live tables are replaced by the rebuilt ones and every
    /// shard cursor points at the head captured when the rebuild started. On
    /// failure or cancellation nothing visible changes. Shards that were
    /// running are restarted either way.
    pub async fn rebuild_projection(&self, projection: &str, cancel: &CancellationToken) -> Result<()> {
        let registered = self.registered(projection)?;
        {
            let _tasks = lock(&self.inner.tasks);
            if !lock(&self.inner.rebuilding).insert(projection.to_string()) {
                return Err(Error::RebuildInProgress(projection.to_string()));
            }
        }

        tracing::info!(projection = %projection, "rebuild started");
        let started = Instant::now();

        let mut was_running = Vec::new();
        let mut outcome = Ok(GlobalPos::NONE);
        for shard in &registered.shards {
            let shard = shard.name.to_string();
            if matches!(self.running_task(&shard, |_| ()), Ok(Some(()))) {
                was_running.push(shard.clone());
            }
            if let Err(err) = self.stop_shard(&shard).await {
                outcome = Err(err);
                break;
            }
        }

        if outcome.is_ok() {
            outcome = self.replay_and_swap(&registered, cancel).await;
        }

        lock(&self.inner.rebuilding).remove(projection);

        match &outcome {
            Ok(ceiling) => tracing::info!(
                projection = %projection,
                ceiling = %ceiling,
                elapsed = ?started.elapsed(),
                "rebuild complete"
            ),
            Err(err) => tracing::warn!(projection = %projection, error = %err, "rebuild abandoned"),
        }

        for shard in was_running {
            self.start_shard(&shard).await?;
        }
        outcome.map(|_| ())
    }

    async fn replay_and_swap(&self, registered: &Registered, cancel: &CancellationToken) -> Result<GlobalPos> {
        let writer = self.inner.store.writer();
        let tables = registered.projection.tables();
        let shadows: Vec<String> = tables
            .iter()
            .map(|t| TableTarget::Rebuild.table_name(t.name()))
            .collect();

        let replayed = self.replay_into_shadows(registered, cancel).await;
        let ceiling = match replayed {
            Ok(ceiling) => ceiling,
            Err(err) => {
                if let Err(cleanup) = writer.drop_tables(shadows).await {
                    tracing::warn!(error = %cleanup, "failed to drop rebuild tables");
                }
                return Err(err);
            }
        };

        let swaps = shadows
            .into_iter()
            .zip(tables.iter().map(|t| t.name().to_string()))
            .collect();
        let progress = registered
            .shards
            .iter()
            .map(|s| (s.name.to_string(), ceiling))
            .collect();
        writer.swap_rebuild(swaps, progress).await?;

        for shard in &registered.shards {
            self.inner.tracker.reset_progress(&shard.name, ceiling);
            self.inner.tracker.set_state(&shard.name, ShardState::Stopped);
        }
        Ok(ceiling)
    }

    async fn replay_into_shadows(&self, registered: &Registered, cancel: &CancellationToken) -> Result<GlobalPos> {
        let store = &self.inner.store;
        let tables = registered.projection.tables();

        store
            .writer()
            .drop_tables(tables.iter().map(|t| TableTarget::Rebuild.table_name(t.name())).collect())
            .await?;
        store
            .writer()
            .ensure_tables(
                tables
                    .iter()
                    .map(|t| (t.clone(), TableTarget::Rebuild.table_name(t.name())))
                    .collect(),
            )
            .await?;

        let ceiling = store.head_position();

        for shard in &registered.shards {
            let mut after = GlobalPos::NONE;
            while after < ceiling {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let page = read_page(
                    store,
                    &registered.projection,
                    &shard.filter,
                    after,
                    Some(ceiling),
                    self.inner.config.batch_size,
                    TableTarget::Rebuild,
                )
                .await?;
                if page.last_seen <= after {
                    break;
                }
                store
                    .writer()
                    .commit_page(PageCommit {
                        ops: page.ops,
                        progress: None,
                    })
                    .await?;
                tracing::debug!(shard = %shard.name, to = %page.last_seen, events = page.events, "rebuild page committed");
                after = page.last_seen;
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(ceiling)
    }
}
