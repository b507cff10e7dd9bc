//! Pattern-based invalidation.
//!
//! Every operation is best-effort: backend failures are logged and reported
//! through the return value, never raised.

use metrics::counter;
use tracing::{debug, info, warn};

use super::{
    backend::{BackendError, BackendHandle},
    config::ClearScope,
    keys::InvalidationPattern,
};

/// Keys per `delete` call when sweeping a pattern.
const DELETE_BATCH: usize = 500;

pub struct Invalidator {
    backend: BackendHandle,
    namespace: String,
    clear_scope: ClearScope,
}

impl Invalidator {
    pub fn new(backend: BackendHandle, namespace: impl Into<String>, clear_scope: ClearScope) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            clear_scope,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Delete every key matching the glob `pattern`.
    ///
    /// Returns how many keys were deleted, which on a mid-sweep failure is
    /// the count removed before the failure.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        match self.sweep(pattern).await {
            Ok(count) => {
                if count > 0 {
                    counter!("readthrough_cache_invalidated_total").increment(count as u64);
                }
                debug!(cache = "response", pattern, count, "invalidated pattern");
                count
            }
            Err((count, err)) => {
                if count > 0 {
                    counter!("readthrough_cache_invalidated_total").increment(count as u64);
                }
                warn!(
                    target = "readthrough::cache::invalidation",
                    pattern,
                    deleted = count,
                    error = %err,
                    "Cache invalidation incomplete"
                );
                count
            }
        }
    }

    /// Delete cached GET responses for `path` and everything under it.
    pub async fn invalidate_by_resource_path(&self, path: &str) -> usize {
        let pattern = InvalidationPattern::for_resource(&self.namespace, path);
        let mut total = 0;
        for glob in pattern.globs() {
            total += self.invalidate_by_pattern(glob).await;
        }
        info!(
            target = "readthrough::cache::invalidation",
            path,
            count = total,
            "Invalidated cache entries"
        );
        total
    }

    /// Remove every cached entry. Returns false when the backend failed.
    pub async fn clear_all(&self) -> bool {
        let result = match self.clear_scope {
            ClearScope::Database => self.backend.flush().await,
            ClearScope::Namespace => {
                let pattern = InvalidationPattern::namespace(&self.namespace);
                let mut outcome = Ok(());
                for glob in pattern.globs() {
                    if let Err((_, err)) = self.sweep(glob).await {
                        outcome = Err(err);
                        break;
                    }
                }
                outcome
            }
        };

        match result {
            Ok(()) => {
                info!(
                    target = "readthrough::cache::invalidation",
                    scope = ?self.clear_scope,
                    "Cache cleared"
                );
                true
            }
            Err(err) => {
                warn!(
                    target = "readthrough::cache::invalidation",
                    scope = ?self.clear_scope,
                    error = %err,
                    "Cache clear failed"
                );
                false
            }
        }
    }

    async fn sweep(&self, pattern: &str) -> Result<usize, (usize, BackendError)> {
        let keys = self.backend.keys(pattern).await.map_err(|err| (0, err))?;
        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            deleted += self
                .backend
                .delete(batch)
                .await
                .map_err(|err| (deleted, err))?;
        }
        Ok(deleted)
    }
}
