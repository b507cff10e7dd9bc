//! Failure-counting guard around a backend.
//!
//! After `failure_threshold` consecutive connectivity failures the guard
//! opens a cooldown window. Inside the window every call fails fast with
//! [`BackendError::CoolingDown`] and the inner backend is not touched, so a
//! dead backend costs requests nothing but a branch.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{BackendError, BackendHandle, BackendResult, StoreBackend};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "cache::backend::guard";
const METRIC_COOLDOWN_TOTAL: &str = "readthrough_cache_backend_cooldown_total";

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Tracks consecutive backend failures and the cooldown window.
#[derive(Debug)]
pub struct BackendHealth {
    failure_threshold: NonZeroU32,
    cooldown: Duration,
    state: Mutex<HealthState>,
}

impl BackendHealth {
    pub fn new(failure_threshold: NonZeroU32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(HealthState::default()),
        }
    }

    /// Fails fast while the cooldown window is open.
    pub fn check(&self) -> BackendResult<()> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "check");
        match state.open_until {
            Some(until) if now < until => Err(BackendError::CoolingDown),
            Some(_) => {
                // Window elapsed: let calls reach the backend again.
                state.open_until = None;
                state.consecutive_failures = 0;
                info!(
                    target = "readthrough::cache::backend",
                    "Backend cooldown elapsed, probing again"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_success");
        state.consecutive_failures = 0;
    }

    pub fn record_failure(&self, error: &BackendError) {
        if !error.is_connectivity() {
            return;
        }

        let mut state = mutex_lock(&self.state, SOURCE, "record_failure");
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.open_until.is_none() && state.consecutive_failures >= self.failure_threshold.get()
        {
            state.open_until = Some(Instant::now() + self.cooldown);
            counter!(METRIC_COOLDOWN_TOTAL).increment(1);
            warn!(
                target = "readthrough::cache::backend",
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                error = %error,
                "Backend marked unavailable"
            );
        }
    }

    /// Whether calls are currently being skipped.
    pub fn is_cooling_down(&self) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "is_cooling_down");
        state.open_until.is_some_and(|until| Instant::now() < until)
    }
}

/// A backend whose calls pass through [`BackendHealth`].
pub struct GuardedBackend {
    inner: BackendHandle,
    health: Arc<BackendHealth>,
}

impl GuardedBackend {
    pub fn new(inner: BackendHandle, health: Arc<BackendHealth>) -> Self {
        Self { inner, health }
    }

    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.health
    }

    async fn guarded<T, F>(&self, call: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>> + Send,
    {
        self.health.check()?;
        let result = call.await;
        match &result {
            Ok(_) => self.health.record_success(),
            Err(error) => self.health.record_failure(error),
        }
        result
    }
}

#[async_trait]
impl StoreBackend for GuardedBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.guarded(self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()> {
        self.guarded(self.inner.set(key, value, ttl)).await
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        self.guarded(self.inner.keys(pattern)).await
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<usize> {
        self.guarded(self.inner.delete(keys)).await
    }

    async fn flush(&self) -> BackendResult<()> {
        self.guarded(self.inner.flush()).await
    }

    async fn db_size(&self) -> BackendResult<u64> {
        self.guarded(self.inner.db_size()).await
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        self.guarded(self.inner.ttl(key)).await
    }

    async fn memory_info(&self) -> BackendResult<String> {
        self.guarded(self.inner.memory_info()).await
    }

    async fn close(&self) -> BackendResult<()> {
        self.inner.close().await
    }
}
