//! Operator-facing cache operations.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::cache::{
    CacheRuntime, InvalidationPattern, Invalidator, MutationEvent, MutationHub, OperationKind,
    backend::{BackendHandle, BackendResult},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheAdminError {
    #[error("{0}")]
    Validation(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_keys: u64,
    pub cache_keys: u64,
    pub memory_used: String,
}

impl CacheStats {
    fn unavailable() -> Self {
        Self {
            total_keys: 0,
            cache_keys: 0,
            memory_used: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidateOutcome {
    pub success: bool,
    pub message: String,
    pub count: usize,
}

#[derive(Clone)]
pub struct CacheAdminService {
    backend: BackendHandle,
    invalidator: Arc<Invalidator>,
    hub: Arc<MutationHub>,
}

impl CacheAdminService {
    pub fn new(backend: BackendHandle, invalidator: Arc<Invalidator>, hub: Arc<MutationHub>) -> Self {
        Self {
            backend,
            invalidator,
            hub,
        }
    }

    pub fn from_runtime(runtime: &CacheRuntime) -> Self {
        Self::new(
            runtime.backend().clone(),
            runtime.invalidator().clone(),
            runtime.hub().clone(),
        )
    }

    /// Key counts and memory usage. A failing backend reports zeros.
    pub async fn get_stats(&self) -> CacheStats {
        match self.collect_stats().await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(
                    target = "readthrough::application::cache_admin",
                    error = %err,
                    "Cache stats unavailable"
                );
                CacheStats::unavailable()
            }
        }
    }

    async fn collect_stats(&self) -> BackendResult<CacheStats> {
        let total_keys = self.backend.db_size().await?;
        let mut cache_keys = 0;
        for glob in InvalidationPattern::namespace(self.invalidator.namespace()).globs() {
            cache_keys += self.backend.keys(glob).await?.len() as u64;
        }
        let memory_used = self.backend.memory_info().await?;

        Ok(CacheStats {
            total_keys,
            cache_keys,
            memory_used,
        })
    }

    pub async fn clear_cache(&self) -> ClearOutcome {
        let success = self.invalidator.clear_all().await;
        let message = if success {
            "All cache cleared successfully"
        } else {
            "Failed to clear cache"
        };
        ClearOutcome {
            success,
            message: message.to_string(),
        }
    }

    pub async fn invalidate_route(
        &self,
        route: Option<&str>,
    ) -> Result<InvalidateOutcome, CacheAdminError> {
        let route = route
            .map(str::trim)
            .filter(|route| !route.is_empty())
            .ok_or(CacheAdminError::Validation("Route parameter is required"))?;

        let count = self.invalidator.invalidate_by_resource_path(route).await;
        Ok(InvalidateOutcome {
            success: true,
            message: format!("Invalidated {count} cache entries for route: {route}"),
            count,
        })
    }

    /// Route an externally reported write through the event hub.
    pub async fn publish_mutation(
        &self,
        kind: Option<OperationKind>,
        collection: Option<&str>,
    ) -> Result<MutationEvent, CacheAdminError> {
        let kind = kind.ok_or(CacheAdminError::Validation(
            "operationKind parameter is required",
        ))?;
        let collection = collection
            .map(str::trim)
            .filter(|collection| !collection.is_empty())
            .ok_or(CacheAdminError::Validation(
                "collectionName parameter is required",
            ))?;

        let event = MutationEvent::new(kind, collection);
        self.hub.publish(event.clone()).await;
        Ok(event)
    }
}
