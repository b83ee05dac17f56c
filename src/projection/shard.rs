//! Shard identity and lifecycle states.

use std::fmt;

use crate::error::{Error, Result};

/// Key of the default single shard of a projection.
pub const ALL_SHARD_KEY: &str = "All";

/// A shard's external handle: `"<Projection>:<ShardKey>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardName {
    projection: String,
    key: String,
}

impl ShardName {
    pub fn new(projection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            projection: projection.into(),
            key: key.into(),
        }
    }

    /// `"<Projection>:All"`.
    pub fn all(projection: impl Into<String>) -> Self {
        Self::new(projection, ALL_SHARD_KEY)
    }

    /// Parses `"<Projection>:<ShardKey>"`; both halves must be non-empty.
    pub fn parse(name: &str) -> Result<Self> {
        match name.split_once(':') {
            Some((projection, key)) if !projection.is_empty() && !key.is_empty() && !key.contains(':') => {
                Ok(Self::new(projection, key))
            }
            _ => Err(Error::Configuration(format!(
                "shard name '{}' is not of the form '<Projection>:<ShardKey>'",
                name
            ))),
        }
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.projection, self.key)
    }
}

/// Lifecycle of a shard.
///
/// ```text
/// Stopped ──► Starting ──► Running ◄──► Paused
///    ▲                        │
///    └──────── Stopping ◄─────┤
///                             ▼
///                          Faulted ──(restart)──► Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    /// Stopped consuming after repeated unexpected errors; progress is kept.
    Faulted,
}

impl ShardState {
    /// True while a task exists for the shard.
    pub fn is_active(&self) -> bool {
        matches!(self, ShardState::Starting | ShardState::Running | ShardState::Paused | ShardState::Stopping)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Stopped => "stopped",
            ShardState::Starting => "starting",
            ShardState::Running => "running",
            ShardState::Paused => "paused",
            ShardState::Stopping => "stopping",
            ShardState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}
