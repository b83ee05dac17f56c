//! Store and daemon configuration.
//!
//! Plain structs with `Default` impls; override individual fields with struct
//! update syntax:
//!
//! ```rust
//! use std::time::Duration;
//! use spitefold::DaemonConfig;
//!
//! let config = DaemonConfig {
//!     batch_size: 50,
//!     poll_interval: Duration::from_millis(100),
//!     ..DaemonConfig::default()
//! };
//! ```

use std::time::Duration;

use crate::types::{StreamIdentityMode, TenantId};

// =============================================================================
// Store Defaults
// =============================================================================

/// Default group-commit window for appends, in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 2;

/// Maximum append commands per group commit.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 500;

/// Minimum number of reader threads.
pub const MIN_READ_THREADS: usize = 2;

/// Maximum number of reader threads.
pub const MAX_READ_THREADS: usize = 8;

/// Configuration for an [`EventStore`](crate::EventStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Stream identity scheme. All streams in one store use the same scheme.
    pub identity: StreamIdentityMode,

    /// Tenant used by the root store handle.
    pub tenant: TenantId,

    /// Reader threads in the pool. `None` sizes the pool from available CPUs.
    pub reader_threads: Option<usize>,

    /// Maximum time to collect appends before committing them together.
    pub batch_timeout: Duration,

    /// Maximum appends per group commit.
    pub batch_max_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            identity: StreamIdentityMode::AsUuid,
            tenant: TenantId::default(),
            reader_threads: None,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

impl StoreConfig {
    /// Configuration for a store keyed by string stream keys.
    pub fn with_string_keys() -> Self {
        Self {
            identity: StreamIdentityMode::AsString,
            ..Self::default()
        }
    }

    /// Number of reader threads to spawn.
    pub fn reader_count(&self) -> usize {
        match self.reader_threads {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_READ_THREADS)
                .clamp(MIN_READ_THREADS, MAX_READ_THREADS),
        }
    }
}

// =============================================================================
// Daemon Defaults
// =============================================================================

/// Events fetched per shard page.
pub const DEFAULT_SHARD_BATCH_SIZE: usize = 500;

/// Fallback wake-up when no append notification arrives.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// First retry delay after a transient failure.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Upper bound on the retry delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Consecutive unexpected failures before a shard is marked faulted.
pub const DEFAULT_MAX_UNEXPECTED_FAILURES: u32 = 3;

/// Time a graceful stop waits for an in-flight page.
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;

/// Configuration for a [`ProjectionDaemon`](crate::ProjectionDaemon).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Maximum events applied per page (one page = one atomic commit).
    pub batch_size: usize,

    /// How long an idle shard sleeps before re-checking the log if it was not notified.
    pub poll_interval: Duration,

    /// Initial delay before retrying a page after a transient error.
    pub retry_base_delay: Duration,

    /// Maximum delay between retries. Delays double from the base up to this cap.
    pub retry_max_delay: Duration,

    /// Consecutive non-transient failures that move a shard to `Faulted`.
    pub max_unexpected_failures: u32,

    /// How long `stop_*` waits for in-flight pages before aborting the task.
    pub stop_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SHARD_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            max_unexpected_failures: DEFAULT_MAX_UNEXPECTED_FAILURES,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }
}

impl DaemonConfig {
    /// Delay before retry number `attempt` (0-based): base doubled per attempt, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}
