//! Owned cache runtime: backend, guard, invalidator and event hub.

use std::sync::Arc;

use tracing::{info, warn};

use super::{
    CacheConfig,
    backend::{
        BackendHandle, BackendHealth, BackendResult, GuardedBackend, MemoryBackend, RedisBackend,
        RedisOptions,
    },
    bridge::MutationBridge,
    events::MutationHub,
    invalidation::Invalidator,
    middleware::CacheState,
};
use crate::config::{BackendKind, BackendSettings};

/// Everything the routers need from the cache, built once at startup and
/// passed around explicitly.
#[derive(Clone)]
pub struct CacheRuntime {
    config: Arc<CacheConfig>,
    backend: BackendHandle,
    health: Arc<BackendHealth>,
    invalidator: Arc<Invalidator>,
    hub: Arc<MutationHub>,
}

impl CacheRuntime {
    /// Build the configured backend and connect once.
    ///
    /// A backend that cannot be reached at startup is not fatal: the guard
    /// records the failure and requests are served uncached until it recovers.
    pub async fn initialize(settings: &BackendSettings, config: CacheConfig) -> BackendResult<Self> {
        let health = Arc::new(BackendHealth::new(
            settings.failure_threshold,
            settings.cooldown,
        ));

        let backend: BackendHandle = match settings.kind {
            BackendKind::Memory => Arc::new(MemoryBackend::new(settings.memory_capacity)),
            BackendKind::Redis => {
                let redis = RedisBackend::new(RedisOptions {
                    host: settings.host.clone(),
                    port: settings.port,
                    password: settings.password.clone(),
                    database: settings.database,
                    connect_timeout: settings.connect_timeout,
                    command_timeout: settings.command_timeout,
                    reconnect_attempts: settings.reconnect_attempts,
                })?;

                if let Err(err) = redis.connect().await {
                    health.record_failure(&err);
                    warn!(
                        target = "readthrough::cache::runtime",
                        host = %settings.host,
                        port = settings.port,
                        error = %err,
                        "Cache backend unreachable at startup, serving uncached"
                    );
                }
                Arc::new(redis)
            }
        };

        info!(
            target = "readthrough::cache::runtime",
            backend = backend.name(),
            enabled = config.enabled,
            namespace = %config.namespace,
            max_age_secs = config.max_age().as_secs(),
            "Cache runtime initialized"
        );

        Ok(Self::with_backend(config, backend, health))
    }

    /// Assemble a runtime over an existing backend.
    pub fn with_backend(config: CacheConfig, backend: BackendHandle, health: Arc<BackendHealth>) -> Self {
        let guarded: BackendHandle = Arc::new(GuardedBackend::new(backend, health.clone()));
        let invalidator = Arc::new(Invalidator::new(
            guarded.clone(),
            config.namespace.clone(),
            config.clear_scope,
        ));

        let hub = Arc::new(MutationHub::new());
        MutationBridge::attach(&hub, invalidator.clone());

        Self {
            config: Arc::new(config),
            backend: guarded,
            health,
            invalidator,
            hub,
        }
    }

    /// State for [`super::response_cache_layer`].
    pub fn cache_state(&self) -> CacheState {
        CacheState::new(self.config.clone(), self.backend.clone())
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    /// The guarded backend.
    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.health
    }

    pub fn invalidator(&self) -> &Arc<Invalidator> {
        &self.invalidator
    }

    pub fn hub(&self) -> &Arc<MutationHub> {
        &self.hub
    }

    /// Release the backend connection.
    pub async fn shutdown(&self) {
        match self.backend.close().await {
            Ok(()) => info!(target = "readthrough::cache::runtime", "Cache runtime shut down"),
            Err(err) => warn!(
                target = "readthrough::cache::runtime",
                error = %err,
                "Cache backend did not close cleanly"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::{NonZeroU32, NonZeroUsize};
    use std::time::Duration;

    use super::*;
    use crate::cache::events::{MutationEvent, OperationKind};

    fn memory_settings() -> BackendSettings {
        BackendSettings {
            kind: BackendKind::Memory,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            database: 0,
            connect_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            reconnect_attempts: NonZeroU32::MIN,
            failure_threshold: NonZeroU32::MIN,
            cooldown: Duration::from_secs(10),
            memory_capacity: NonZeroUsize::new(16).expect("non-zero"),
        }
    }

    #[tokio::test]
    async fn memory_runtime_wires_bridge_to_backend() {
        let runtime = CacheRuntime::initialize(&memory_settings(), CacheConfig::default())
            .await
            .expect("runtime builds");
        assert_eq!(runtime.backend().name(), "memory");

        runtime
            .backend()
            .set("cache:GET:/api/products:", "v".to_string(), Duration::from_secs(60))
            .await
            .expect("set");
        runtime
            .hub()
            .publish(MutationEvent::new(OperationKind::Update, "products"))
            .await;
        assert_eq!(runtime.backend().db_size().await, Ok(0));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_redis_is_not_fatal() {
        let settings = BackendSettings {
            kind: BackendKind::Redis,
            host: "127.0.0.1".to_string(),
            port: 1,
            ..memory_settings()
        };

        let runtime = CacheRuntime::initialize(&settings, CacheConfig::default())
            .await
            .expect("runtime builds without a server");
        assert!(runtime.health().is_cooling_down());
    }
}
