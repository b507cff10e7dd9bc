//! Response entries and the typed store over a backend.
//!
//! Entries are serialized as JSON with a base64 body so the backend only
//! ever sees strings. Lookups report their outcome explicitly so the
//! middleware can branch on backend failure without catching anything.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backend::{BackendError, BackendHandle};
use super::keys::CacheKey;

/// Response headers the middleware manages itself.
pub const HEADER_CACHE: &str = "x-cache";
pub const HEADER_CACHE_KEY: &str = "x-cache-key";
pub const HEADER_CACHE_TTL: &str = "x-cache-ttl";
pub const HEADER_CACHE_STORED: &str = "x-cache-stored";

const UNREPLAYED_HEADERS: [&str; 8] = [
    HEADER_CACHE,
    HEADER_CACHE_KEY,
    HEADER_CACHE_TTL,
    HEADER_CACHE_STORED,
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("stored entry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored body is not valid base64: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("stored status {0} is not a cacheable status")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Entry(#[from] EntryError),
}

/// Cached HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CachedResponse {
    /// Capture the replayable parts of a downstream response.
    pub fn capture(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !UNREPLAYED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();

        Self {
            status: status.as_u16(),
            headers,
            body,
        }
    }

    pub fn encode(&self) -> Result<String, EntryError> {
        let entry = StoredEntry {
            status: self.status,
            headers: self.headers.clone(),
            body: BASE64.encode(&self.body),
        };
        Ok(serde_json::to_string(&entry)?)
    }

    pub fn decode(raw: &str) -> Result<Self, EntryError> {
        let entry: StoredEntry = serde_json::from_str(raw)?;
        if !(200..300).contains(&entry.status) {
            return Err(EntryError::Status(entry.status));
        }
        let body = BASE64.decode(entry.body.as_bytes())?;
        Ok(Self {
            status: entry.status,
            headers: entry.headers,
            body: Bytes::from(body),
        })
    }

    /// Rebuild the response, skipping headers that no longer parse.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);

        for (name, value) in self.headers {
            if let Ok(header_value) = HeaderValue::from_str(&value) {
                builder = builder.header(name, header_value);
            }
        }

        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Whether a downstream response may be written to the cache.
///
/// Successful, cookie-free, non-streaming, unencoded responses whose declared
/// size fits under `max_body_bytes`. Encoded bodies depend on the request's
/// `Accept-Encoding`, which is not part of the key.
pub fn is_storable(response: &Response, max_body_bytes: usize) -> bool {
    use axum::body::HttpBody;

    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| !value.trim().eq_ignore_ascii_case("identity"))
    {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    response
        .body()
        .size_hint()
        .upper()
        .is_none_or(|upper| upper <= max_body_bytes as u64)
}

/// Result of looking a key up.
#[derive(Debug)]
pub enum LookupOutcome {
    Hit(CachedResponse),
    Miss,
    /// The stored value could not be decoded; treated as a miss and overwritten.
    Corrupt(EntryError),
    /// The backend could not answer.
    Unavailable(BackendError),
}

/// Response entries over a backend.
#[derive(Clone)]
pub struct ResponseStore {
    backend: BackendHandle,
    max_age: Duration,
}

impl ResponseStore {
    pub fn new(backend: BackendHandle, max_age: Duration) -> Self {
        Self { backend, max_age }
    }

    pub async fn lookup(&self, key: &CacheKey) -> LookupOutcome {
        match self.backend.get(key.as_str()).await {
            Ok(Some(raw)) => match CachedResponse::decode(&raw) {
                Ok(cached) => LookupOutcome::Hit(cached),
                Err(err) => LookupOutcome::Corrupt(err),
            },
            Ok(None) => LookupOutcome::Miss,
            Err(err) => LookupOutcome::Unavailable(err),
        }
    }

    /// Remaining lifetime, or `None` when unknown.
    pub async fn remaining_ttl(&self, key: &CacheKey) -> Option<Duration> {
        self.backend.ttl(key.as_str()).await.ok().flatten()
    }

    /// Write `response` under `key`, replacing any previous entry.
    pub async fn store(&self, key: &CacheKey, response: &CachedResponse) -> Result<(), StoreError> {
        let encoded = response.encode()?;
        self.backend
            .set(key.as_str(), encoded, self.max_age)
            .await?;
        Ok(())
    }
}
