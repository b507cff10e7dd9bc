//! In-process backend.
//!
//! Bounded by an LRU so a single process cannot grow without limit. Expiry
//! follows the tokio clock, which lets tests pause and advance time.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;

use super::{BackendError, BackendResult, StoreBackend, format_memory};
use crate::cache::keys::glob_matches;
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "cache::backend::memory";
const DEFAULT_CAPACITY: usize = 10_000;
/// Longer lifetimes are clamped; the clock cannot represent arbitrary deadlines.
const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct MemoryBackend {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Drop every expired entry; returns how many were removed.
    fn purge_expired(entries: &mut LruCache<String, MemoryEntry>, now: Instant) -> usize {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let live = entries.get(key).map(|entry| entry.is_live(now));
        match live {
            Some(true) => Ok(entries.get(key).map(|entry| entry.value.clone())),
            Some(false) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()> {
        let expires_at = Instant::now()
            .checked_add(ttl.min(MAX_TTL))
            .ok_or_else(|| BackendError::command("set", "expiry out of range"))?;
        mutex_lock(&self.entries, SOURCE, "set")
            .put(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "keys");
        Self::purge_expired(&mut entries, now);
        Ok(entries
            .iter()
            .filter(|(key, _)| glob_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<usize> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "delete");
        let deleted = keys
            .iter()
            .filter_map(|key| entries.pop(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(deleted)
    }

    async fn flush(&self) -> BackendResult<()> {
        mutex_lock(&self.entries, SOURCE, "flush").clear();
        Ok(())
    }

    async fn db_size(&self) -> BackendResult<u64> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "db_size");
        Self::purge_expired(&mut entries, now);
        Ok(entries.len() as u64)
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        let now = Instant::now();
        let entries = mutex_lock(&self.entries, SOURCE, "ttl");
        Ok(entries
            .peek(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at.duration_since(now)))
    }

    async fn memory_info(&self) -> BackendResult<String> {
        let entries = mutex_lock(&self.entries, SOURCE, "memory_info");
        let bytes: usize = entries
            .iter()
            .map(|(key, entry)| key.len() + entry.value.len())
            .sum();
        Ok(format_memory(bytes as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_get_roundtrip() {
        let backend = MemoryBackend::default();
        assert_eq!(backend.get("a").await, Ok(None));

        backend.set("a", "1".to_string(), MINUTE).await.expect("set");
        assert_eq!(backend.get("a").await, Ok(Some("1".to_string())));

        backend.set("a", "2".to_string(), MINUTE).await.expect("overwrite");
        assert_eq!(backend.get("a").await, Ok(Some("2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_at_ttl() {
        let backend = MemoryBackend::default();
        backend
            .set("a", "1".to_string(), Duration::from_secs(1))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(backend.get("a").await.expect("get").is_some());
        let remaining = backend.ttl("a").await.expect("ttl").expect("has ttl");
        assert_eq!(remaining, Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(backend.get("a").await, Ok(None));
        assert_eq!(backend.ttl("a").await, Ok(None));
        assert_eq!(backend.db_size().await, Ok(0));
    }

    #[tokio::test]
    async fn huge_ttl_is_clamped() {
        let backend = MemoryBackend::default();
        backend
            .set("a", "1".to_string(), Duration::MAX)
            .await
            .expect("set");

        let remaining = backend.ttl("a").await.expect("ttl").expect("has ttl");
        assert!(remaining <= MAX_TTL);
        assert_eq!(backend.get("a").await, Ok(Some("1".to_string())));
    }

    #[tokio::test]
    async fn keys_and_bulk_delete() {
        let backend = MemoryBackend::default();
        for key in ["cache:GET:/a:", "cache:GET:/a:x=1", "cache:GET:/b:", "other"] {
            backend.set(key, "v".to_string(), MINUTE).await.expect("set");
        }

        let mut matched = backend.keys("cache:GET:/a:*").await.expect("keys");
        matched.sort();
        assert_eq!(matched, ["cache:GET:/a:", "cache:GET:/a:x=1"]);

        assert_eq!(backend.delete(&matched).await, Ok(2));
        assert_eq!(backend.delete(&matched).await, Ok(0));
        assert_eq!(backend.db_size().await, Ok(2));
    }

    #[tokio::test]
    async fn lru_capacity_evicts_oldest() {
        let backend = MemoryBackend::new(NonZeroUsize::new(2).expect("non-zero"));
        backend.set("a", "1".to_string(), MINUTE).await.expect("set");
        backend.set("b", "2".to_string(), MINUTE).await.expect("set");
        backend.set("c", "3".to_string(), MINUTE).await.expect("set");

        assert_eq!(backend.get("a").await, Ok(None));
        assert_eq!(backend.db_size().await, Ok(2));
    }

    #[tokio::test]
    async fn flush_and_memory_info() {
        let backend = MemoryBackend::default();
        backend.set("k", "value".to_string(), MINUTE).await.expect("set");
        assert_eq!(backend.memory_info().await, Ok("6B".to_string()));

        backend.flush().await.expect("flush");
        assert_eq!(backend.db_size().await, Ok(0));
        assert_eq!(backend.memory_info().await, Ok("0B".to_string()));
    }
}
