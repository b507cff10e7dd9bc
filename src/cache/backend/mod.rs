//! Key/value store backends.
//!
//! The cache core talks to storage only through [`StoreBackend`]. Keys and
//! patterns use glob syntax where `*` matches any run of characters.

mod guard;
mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use guard::{BackendHealth, GuardedBackend};
pub use memory::MemoryBackend;
pub use self::redis::{RedisBackend, RedisOptions};

/// Shared handle to the process-wide backend.
pub type BackendHandle = Arc<dyn StoreBackend>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    /// A connect or command did not finish in time.
    #[error("backend operation `{op}` timed out")]
    Timeout { op: &'static str },
    /// Too many consecutive failures; calls are skipped until the window ends.
    #[error("backend cooling down after repeated failures")]
    CoolingDown,
    /// The backend answered with an error.
    #[error("backend command `{op}` failed: {message}")]
    Command { op: &'static str, message: String },
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn command(op: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            op,
            message: message.into(),
        }
    }

    /// Whether the error says something about backend reachability, as
    /// opposed to a rejected command on a healthy connection.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Storage contract required by the cache core.
///
/// Implementations must make each single-key operation atomic. Multi-key
/// deletes may complete partially.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Short label used in logs and stats.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()>;

    /// Every live key matching the glob `pattern`.
    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>>;

    /// Delete `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> BackendResult<usize>;

    /// Remove every key in the backend database.
    async fn flush(&self) -> BackendResult<()>;

    /// Number of live keys in the backend database.
    async fn db_size(&self) -> BackendResult<u64>;

    /// Remaining lifetime of `key`; `None` when absent or without expiry.
    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>>;

    /// Human-readable memory usage, e.g. `1.5M`.
    async fn memory_info(&self) -> BackendResult<String>;

    /// Release connections. Later calls may fail.
    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Format a byte count with the single-letter suffixes Redis uses for
/// `used_memory_human` (`B`, `K`, `M`, `G`, `T`).
pub fn format_memory(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];

    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        return format!("{bytes}{}", UNITS[unit_index]);
    }

    format!("{value:.2}{}", UNITS[unit_index])
}
