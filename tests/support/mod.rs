#![allow(dead_code)]

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::Path,
    http::{HeaderMap, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use readthrough::cache::{
    CacheConfig, CacheRuntime,
    backend::{
        BackendError, BackendHandle, BackendHealth, BackendResult, MemoryBackend, StoreBackend,
    },
};
use futures::stream;
use readthrough::infra::http::cache_router;
use tower::ServiceExt;

/// Chunks served by `/api/stream`, 40 bytes in total.
pub const STREAM_CHUNKS: [&str; 4] = ["0123456789", "abcdefghij", "klmnopqrst", "uvwxyz0123"];

/// Memory backend whose operations can be made to fail on demand.
#[derive(Default)]
pub struct ScriptedBackend {
    inner: MemoryBackend,
    pub fail_get: AtomicBool,
    pub fail_set: AtomicBool,
    pub fail_keys: AtomicBool,
    pub fail_flush: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Deletes that still succeed once `fail_delete` is set.
    pub deletes_before_failure: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn failing() -> Self {
        let backend = Self::default();
        backend.fail_get.store(true, Ordering::SeqCst);
        backend.fail_set.store(true, Ordering::SeqCst);
        backend
    }

    pub fn read_only() -> Self {
        let backend = Self::default();
        backend.fail_set.store(true, Ordering::SeqCst);
        backend
    }

    /// Every operation fails.
    pub fn down() -> Self {
        let backend = Self::failing();
        backend.fail_keys.store(true, Ordering::SeqCst);
        backend.fail_flush.store(true, Ordering::SeqCst);
        backend.fail_delete.store(true, Ordering::SeqCst);
        backend
    }

    /// Fail every delete after the first `allowed`.
    pub fn fail_deletes_after(&self, allowed: usize) {
        self.deletes_before_failure.store(allowed, Ordering::SeqCst);
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    fn refused<T>() -> BackendResult<T> {
        Err(BackendError::unavailable("connection refused"))
    }
}

#[async_trait]
impl StoreBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            return Self::refused();
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Self::refused();
        }
        self.inner.set(key, value, ttl).await
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        if self.fail_keys.load(Ordering::SeqCst) {
            return Self::refused();
        }
        self.inner.keys(pattern).await
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<usize> {
        let previous = self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst)
            && previous >= self.deletes_before_failure.load(Ordering::SeqCst)
        {
            return Self::refused();
        }
        self.inner.delete(keys).await
    }

    async fn flush(&self) -> BackendResult<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Self::refused();
        }
        self.inner.flush().await
    }

    async fn db_size(&self) -> BackendResult<u64> {
        self.inner.db_size().await
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn memory_info(&self) -> BackendResult<String> {
        self.inner.memory_info().await
    }
}

/// Counts downstream handler invocations.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A small content API standing in for the upstream.
pub fn content_api(calls: Calls) -> Router {
    let products = calls.clone();
    let orders = calls.clone();
    let categories = calls.clone();
    let profile = calls.clone();
    let empty = calls.clone();
    let session = calls.clone();
    let streamed = calls.clone();
    let broken = calls.clone();
    let encoded = calls.clone();
    let public = calls.clone();
    let removal = calls;

    Router::new()
        .route(
            "/api/products",
            get(move || {
                let calls = products.clone();
                async move {
                    calls.bump();
                    (
                        [(header::CONTENT_TYPE, "application/json")],
                        r#"{"data":[{"id":1,"name":"Desk"}]}"#,
                    )
                }
            })
            .post(|| async { StatusCode::CREATED }),
        )
        .route(
            "/api/orders",
            get(move || {
                let calls = orders.clone();
                async move {
                    calls.bump();
                    r#"{"data":[]}"#
                }
            }),
        )
        .route(
            "/api/categories",
            get(move || {
                let calls = categories.clone();
                async move {
                    calls.bump();
                    r#"{"data":["office"]}"#
                }
            }),
        )
        .route(
            "/api/auth/me",
            get(move || {
                let calls = profile.clone();
                async move {
                    calls.bump();
                    r#"{"user":"me"}"#
                }
            }),
        )
        .route(
            "/api/empty",
            get(move || {
                let calls = empty.clone();
                async move {
                    calls.bump();
                    StatusCode::OK
                }
            }),
        )
        .route(
            "/api/session",
            get(move || {
                let calls = session.clone();
                async move {
                    calls.bump();
                    ([(header::SET_COOKIE, "sid=abc")], "session")
                }
            }),
        )
        .route(
            "/api/stream",
            get(move || {
                let calls = streamed.clone();
                async move {
                    calls.bump();
                    let chunks: Vec<Result<&'static str, std::io::Error>> =
                        STREAM_CHUNKS.iter().copied().map(Ok).collect();
                    Body::from_stream(stream::iter(chunks))
                }
            }),
        )
        .route(
            "/api/broken",
            get(move || {
                let calls = broken.clone();
                async move {
                    calls.bump();
                    let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
                        Ok(r#"{"data":["#),
                        Err(std::io::Error::other("upstream reset")),
                    ];
                    Body::from_stream(stream::iter(chunks))
                }
            }),
        )
        .route(
            "/api/encoded",
            get(move |headers: HeaderMap| {
                let calls = encoded.clone();
                async move {
                    calls.bump();
                    let gzip = headers
                        .get(header::ACCEPT_ENCODING)
                        .and_then(|value| value.to_str().ok())
                        .is_some_and(|value| value.contains("gzip"));
                    if gzip {
                        ([(header::CONTENT_ENCODING, "gzip")], "compressed").into_response()
                    } else {
                        "plain".into_response()
                    }
                }
            }),
        )
        .route(
            "/api/public",
            get(move || {
                let calls = public.clone();
                async move {
                    calls.bump();
                    (
                        [
                            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                            (header::ACCESS_CONTROL_EXPOSE_HEADERS, "X-Total-Count"),
                        ],
                        r#"{"data":[]}"#,
                    )
                }
            }),
        )
        .route(
            "/api/products/{id}",
            delete(move |Path(id): Path<String>| {
                let calls = removal.clone();
                async move {
                    calls.bump();
                    if id == "missing" {
                        StatusCode::NOT_FOUND.into_response()
                    } else {
                        StatusCode::NO_CONTENT.into_response()
                    }
                }
            }),
        )
}

pub struct TestApp {
    pub router: Router,
    pub runtime: CacheRuntime,
    pub calls: Calls,
}

impl TestApp {
    pub fn new(config: CacheConfig, backend: BackendHandle) -> Self {
        Self::with_threshold(config, backend, 100)
    }

    pub fn with_threshold(config: CacheConfig, backend: BackendHandle, threshold: u32) -> Self {
        let health = Arc::new(BackendHealth::new(
            NonZeroU32::new(threshold).unwrap_or(NonZeroU32::MIN),
            Duration::from_secs(10),
        ));
        let runtime = CacheRuntime::with_backend(config, backend, health);
        let calls = Calls::default();
        let router = cache_router(
            content_api(calls.clone()),
            runtime.cache_state(),
            runtime.hub().clone(),
        );
        Self {
            router,
            runtime,
            calls,
        }
    }

    pub fn memory() -> Self {
        Self::new(CacheConfig::default(), Arc::new(MemoryBackend::default()))
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(request(Method::GET, uri)).await
    }
}

pub fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

pub fn header_value<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    String::from_utf8(bytes.to_vec()).expect("body should be utf-8")
}
