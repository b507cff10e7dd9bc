//! Cooldown timer for hot-path logging.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::throttle";

/// Admits at most one event per interval.
///
/// Shared by every component that would otherwise log the same failure on
/// each request while the backend is down.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Returns true when the caller should emit its log line now.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut last = mutex_lock(&self.last, SOURCE, "admit");
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
