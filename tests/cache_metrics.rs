mod support;

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use readthrough::cache::{
    CacheConfig,
    backend::{BackendHandle, BackendHealth, GuardedBackend, StoreBackend},
};
use readthrough::infra::telemetry;

use support::{ScriptedBackend, TestApp};

#[tokio::test]
async fn cache_metrics_are_emitted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    metrics::set_global_recorder(recorder).expect("install recorder");
    telemetry::describe_metrics();

    let app = TestApp::memory();
    app.get("/api/products").await;
    app.get("/api/products").await;
    app.runtime
        .invalidator()
        .invalidate_by_resource_path("/api/products")
        .await;

    let broken = TestApp::new(CacheConfig::default(), Arc::new(ScriptedBackend::failing()));
    broken.get("/api/products").await;

    let health = Arc::new(BackendHealth::new(NonZeroU32::MIN, Duration::from_secs(5)));
    let inner: BackendHandle = Arc::new(ScriptedBackend::failing());
    let guarded = GuardedBackend::new(inner, health);
    assert!(guarded.get("any").await.is_err());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect();

    for expected in [
        "readthrough_cache_hit_total",
        "readthrough_cache_miss_total",
        "readthrough_cache_store_total",
        "readthrough_cache_error_total",
        "readthrough_cache_invalidated_total",
        "readthrough_cache_backend_cooldown_total",
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }
}
