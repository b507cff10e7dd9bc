//! Response cache middleware.
//!
//! Serves eligible GET requests from the backend and stores successful
//! downstream responses. Backend trouble never fails a request: the response
//! is tagged `X-Cache: ERROR` and the downstream handler runs exactly once.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig,
    backend::{BackendError, BackendHandle},
    keys::{CacheKey, QueryParams},
    store::{
        CachedResponse, HEADER_CACHE, HEADER_CACHE_KEY, HEADER_CACHE_STORED, HEADER_CACHE_TTL,
        LookupOutcome, ResponseStore, StoreError, is_storable,
    },
    throttle::LogThrottle,
};

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: Arc<CacheConfig>,
    pub store: ResponseStore,
    throttle: Arc<LogThrottle>,
}

impl CacheState {
    pub fn new(config: Arc<CacheConfig>, backend: BackendHandle) -> Self {
        let store = ResponseStore::new(backend, config.max_age());
        let throttle = Arc::new(LogThrottle::new(config.error_log_interval()));
        Self {
            config,
            store,
            throttle,
        }
    }

    fn report_backend_error(&self, op: &'static str, error: &BackendError) {
        if self.throttle.admit() {
            warn!(
                target = "readthrough::cache::middleware",
                op,
                error = %error,
                "Cache backend unavailable, serving without cache"
            );
        } else {
            debug!(cache = "response", op, error = %error, "cache backend unavailable");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
    Error,
}

impl CacheStatus {
    fn as_header(self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Error => "ERROR",
        })
    }
}

/// Why a request skipped the cache entirely.
fn bypass_reason(config: &CacheConfig, request: &Request<Body>) -> Option<&'static str> {
    if request.method() != Method::GET {
        return Some("method");
    }
    if request.headers().contains_key(header::AUTHORIZATION) {
        return Some("authorization");
    }
    if config.is_excluded(request.uri().path()) {
        return Some("excluded");
    }
    None
}

fn tag(headers: &mut HeaderMap, status: CacheStatus, key: &CacheKey) {
    headers.insert(HEADER_CACHE, status.as_header());
    if let Ok(value) = HeaderValue::from_str(key.as_str()) {
        headers.insert(HEADER_CACHE_KEY, value);
    }
}

/// Middleware for the read-through response cache.
///
/// Only GET requests without credentials and outside the excluded prefixes
/// take part. Hits never reach `next`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enabled {
        return next.run(request).await;
    }

    if let Some(reason) = bypass_reason(&cache.config, &request) {
        debug!(cache = "response", outcome = "bypass", reason, "skipping cache");
        return next.run(request).await;
    }

    let query = QueryParams::parse(request.uri().query().unwrap_or(""));
    let key = match CacheKey::derive(
        &cache.config.namespace,
        request.method(),
        request.uri().path(),
        &query,
        cache.config.include_query,
    ) {
        Ok(key) => key,
        Err(err) => {
            debug!(cache = "response", outcome = "bypass", error = %err, "no cache key");
            return next.run(request).await;
        }
    };

    match cache.store.lookup(&key).await {
        LookupOutcome::Hit(cached) => {
            counter!("readthrough_cache_hit_total").increment(1);
            debug!(cache = "response", outcome = "hit", key = %key, "serving cached response");

            let ttl = cache.store.remaining_ttl(&key).await;
            let mut response = cached.into_response();
            let headers = response.headers_mut();
            tag(headers, CacheStatus::Hit, &key);
            if let Some(ttl) = ttl {
                headers.insert(HEADER_CACHE_TTL, HeaderValue::from(ttl.as_secs()));
            }
            return response;
        }
        LookupOutcome::Miss => {}
        LookupOutcome::Corrupt(err) => {
            warn!(
                target = "readthrough::cache::middleware",
                key = %key,
                error = %err,
                "Discarding unreadable cache entry"
            );
        }
        LookupOutcome::Unavailable(err) => {
            counter!("readthrough_cache_error_total").increment(1);
            cache.report_backend_error("lookup", &err);
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert(HEADER_CACHE, CacheStatus::Error.as_header());
            return response;
        }
    }

    counter!("readthrough_cache_miss_total").increment(1);
    debug!(cache = "response", outcome = "miss", key = %key, "executing handler");

    let response = next.run(request).await;
    capture(&cache, &key, response).await
}

/// A downstream body read up to the storage limit.
enum Buffered {
    /// The whole body, within the limit.
    Complete(Bytes),
    /// Over the limit: the bytes read so far followed by the unread rest.
    Oversize(Body),
}

/// Buffer `body` while it fits in `limit`; past it, hand the stream back untouched.
async fn buffer_within(body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut rest = body.into_data_stream();
    let mut buffered = BytesMut::new();

    while let Some(chunk) = rest.next().await {
        buffered.extend_from_slice(&chunk?);
        if buffered.len() > limit {
            let head = stream::once(async move { Ok::<_, axum::Error>(buffered.freeze()) });
            return Ok(Buffered::Oversize(Body::from_stream(head.chain(rest))));
        }
    }

    Ok(Buffered::Complete(buffered.freeze()))
}

/// Store a downstream response when eligible and tag the outcome.
async fn capture(cache: &CacheState, key: &CacheKey, response: Response) -> Response {
    let max_body_bytes = cache.config.max_body_bytes;

    if !is_storable(&response, max_body_bytes) {
        let mut response = response;
        tag(response.headers_mut(), CacheStatus::Miss, key);
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_within(body, max_body_bytes).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Oversize(body)) => {
            debug!(
                cache = "response",
                key = %key,
                max_body_bytes,
                "body over storage limit, passing through"
            );
            tag(&mut parts.headers, CacheStatus::Miss, key);
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            warn!(
                target = "readthrough::cache::middleware",
                key = %key,
                error = %err,
                "Failed to read downstream response body"
            );
            let mut response = StatusCode::BAD_GATEWAY.into_response();
            tag(response.headers_mut(), CacheStatus::Miss, key);
            return response;
        }
    };

    if bytes.is_empty() {
        tag(&mut parts.headers, CacheStatus::Miss, key);
        return Response::from_parts(parts, Body::from(bytes));
    }

    let cached = CachedResponse::capture(parts.status, &parts.headers, bytes.clone());
    let status = match cache.store.store(key, &cached).await {
        Ok(()) => {
            counter!("readthrough_cache_store_total").increment(1);
            parts
                .headers
                .insert(HEADER_CACHE_STORED, HeaderValue::from_static("true"));
            CacheStatus::Miss
        }
        Err(StoreError::Backend(err)) => {
            counter!("readthrough_cache_error_total").increment(1);
            cache.report_backend_error("store", &err);
            CacheStatus::Error
        }
        Err(StoreError::Entry(err)) => {
            warn!(
                target = "readthrough::cache::middleware",
                key = %key,
                error = %err,
                "Failed to encode cache entry"
            );
            CacheStatus::Miss
        }
    };

    tag(&mut parts.headers, status, key);
    Response::from_parts(parts, Body::from(bytes))
}
