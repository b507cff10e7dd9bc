//! Redis-backed store.
//!
//! Connections come from a `deadpool-redis` pool. A failed dial is remembered
//! and shared: until its backoff elapses every caller gets the same error
//! without dialing again. Pool waits, dials and commands are each bounded by
//! a timeout.

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use ::redis::{Cmd, FromRedisValue, RedisError, cmd};
use async_trait::async_trait;
use deadpool_redis::{
    Config as RedisPoolConfig, Connection, Pool, PoolConfig, PoolError, Runtime, Timeouts,
};
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use super::{BackendError, BackendResult, StoreBackend};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "cache::backend::redis";
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_STEP: Duration = Duration::from_millis(50);
const POOL_SIZE: usize = 16;

/// Connection parameters for [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect_attempts: NonZeroU32,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            database: 0,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(1),
            reconnect_attempts: NonZeroU32::new(3).unwrap_or(NonZeroU32::MIN),
        }
    }
}

impl RedisOptions {
    /// Connection URL with the password percent-encoded.
    pub fn url(&self) -> BackendResult<Url> {
        let mut url = Url::parse(&format!(
            "redis://{}:{}/{}",
            self.host, self.port, self.database
        ))
        .map_err(|err| BackendError::unavailable(format!("invalid redis address: {err}")))?;

        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| BackendError::unavailable("redis url cannot carry a password"))?;
        }

        Ok(url)
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
fn backoff(attempt: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(attempt).min(MAX_BACKOFF)
}

fn classify(op: &'static str, err: RedisError) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout { op }
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BackendError::unavailable(err.to_string())
    } else {
        BackendError::command(op, err.to_string())
    }
}

/// Pull `used_memory_human` out of an `INFO memory` reply.
pub(crate) fn parse_used_memory_human(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("used_memory_human:"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn classify_pool(err: PoolError) -> BackendError {
    match err {
        PoolError::Timeout(_) => BackendError::Timeout { op: "connect" },
        PoolError::Backend(err) => classify("connect", err),
        other => BackendError::unavailable(other.to_string()),
    }
}

/// Outcome of recent dials, shared by every caller.
#[derive(Debug, Default)]
struct DialState {
    failures: u32,
    retry_at: Option<Instant>,
    last_error: Option<BackendError>,
}

impl DialState {
    /// The remembered failure while its backoff window is open.
    fn pending_failure(&self, now: Instant) -> Option<BackendError> {
        match self.retry_at {
            Some(at) if now < at => self.last_error.clone(),
            _ => None,
        }
    }

    /// Remember `error` and open a backoff window; returns its length.
    fn record_failure(&mut self, error: &BackendError, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = backoff(self.failures);
        self.retry_at = Some(now + delay);
        self.last_error = Some(error.clone());
        delay
    }

    /// Forget past failures; returns true if there were any.
    fn record_success(&mut self) -> bool {
        let recovered = self.failures > 0;
        *self = Self::default();
        recovered
    }
}

pub struct RedisBackend {
    pool: Pool,
    options: RedisOptions,
    dial: Mutex<DialState>,
}

impl RedisBackend {
    /// Build the pool without connecting.
    pub fn new(options: RedisOptions) -> BackendResult<Self> {
        let url = options.url()?;

        let mut timeouts = Timeouts::default();
        timeouts.wait = Some(options.connect_timeout);
        timeouts.create = Some(options.connect_timeout);
        timeouts.recycle = Some(options.command_timeout);

        let mut pool_config = PoolConfig::new(POOL_SIZE);
        pool_config.timeouts = timeouts;

        let mut config = RedisPoolConfig::from_url(url.as_str());
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| BackendError::unavailable(format!("invalid redis pool: {err}")))?;

        Ok(Self {
            pool,
            options,
            dial: Mutex::new(DialState::default()),
        })
    }

    /// Establish a connection eagerly, retrying up to `reconnect_attempts` times.
    pub async fn connect(&self) -> BackendResult<()> {
        let attempts = self.options.reconnect_attempts.get();
        let mut attempt = 1;

        loop {
            match self.pool.get().await.map_err(classify_pool) {
                Ok(_) => {
                    mutex_lock(&self.dial, SOURCE, "connect").record_success();
                    info!(
                        target = "readthrough::cache::backend",
                        host = %self.options.host,
                        port = self.options.port,
                        attempt,
                        "Redis connected"
                    );
                    return Ok(());
                }
                Err(error) if attempt < attempts => {
                    debug!(
                        target = "readthrough::cache::backend",
                        attempt,
                        attempts,
                        error = %error,
                        "Redis connect attempt failed"
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => {
                    mutex_lock(&self.dial, SOURCE, "connect").record_failure(&error, Instant::now());
                    return Err(error);
                }
            }
        }
    }

    async fn connection(&self) -> BackendResult<Connection> {
        let pending = mutex_lock(&self.dial, SOURCE, "pending").pending_failure(Instant::now());
        if let Some(error) = pending {
            return Err(error);
        }

        match self.pool.get().await {
            Ok(conn) => {
                let recovered = mutex_lock(&self.dial, SOURCE, "success").record_success();
                if recovered {
                    info!(target = "readthrough::cache::backend", "Redis reachable again");
                }
                Ok(conn)
            }
            Err(err) => {
                let error = classify_pool(err);
                let retry_in =
                    mutex_lock(&self.dial, SOURCE, "failure").record_failure(&error, Instant::now());
                debug!(
                    target = "readthrough::cache::backend",
                    error = %error,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    "Redis dial failed"
                );
                Err(error)
            }
        }
    }

    async fn query<T>(&self, op: &'static str, command: Cmd) -> BackendResult<T>
    where
        T: FromRedisValue + Send,
    {
        let mut conn = self.connection().await?;
        match tokio::time::timeout(self.options.command_timeout, command.query_async(&mut conn)).await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(op, err)),
            Err(_) => Err(BackendError::Timeout { op }),
        }
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut command = cmd("GET");
        command.arg(key);
        self.query("get", command).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut command = cmd("SET");
        command.arg(key).arg(value).arg("PX").arg(millis);
        self.query("set", command).await
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let mut command = cmd("KEYS");
        command.arg(pattern);
        self.query("keys", command).await
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut command = cmd("DEL");
        for key in keys {
            command.arg(key);
        }
        self.query("delete", command).await
    }

    async fn flush(&self) -> BackendResult<()> {
        self.query("flush", cmd("FLUSHDB")).await
    }

    async fn db_size(&self) -> BackendResult<u64> {
        self.query("db_size", cmd("DBSIZE")).await
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        let mut command = cmd("PTTL");
        command.arg(key);
        let millis: i64 = self.query("ttl", command).await?;
        // -2: absent, -1: no expiry.
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn memory_info(&self) -> BackendResult<String> {
        let mut command = cmd("INFO");
        command.arg("memory");
        let info: String = self.query("memory_info", command).await?;
        Ok(parse_used_memory_human(&info).unwrap_or_else(|| "unknown".to_string()))
    }

    async fn close(&self) -> BackendResult<()> {
        self.pool.close();
        info!(target = "readthrough::cache::backend", "Redis pool closed");
        Ok(())
    }
}
