//! Forwarding handler to the upstream content API.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::{Client, Url};
use thiserror::Error;

use crate::application::error::HttpError;

const SOURCE: &str = "infra::http::upstream";
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no upstream configured")]
    NotConfigured,
    #[error("invalid upstream path: {0}")]
    Url(#[from] url::ParseError),
    #[error("request body unreadable: {0}")]
    Body(String),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct Upstream {
    client: Client,
    base: Option<Url>,
}

impl Upstream {
    pub fn new(base: Option<Url>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .user_agent(concat!("readthrough/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }

    fn target(&self, path_and_query: &str) -> Result<Url, UpstreamError> {
        let base = self.base.as_ref().ok_or(UpstreamError::NotConfigured)?;
        Ok(base.join(path_and_query)?)
    }

    async fn forward(&self, request: Request<Body>) -> Result<Response, UpstreamError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = self.target(&path_and_query)?;

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
            .await
            .map_err(|err| UpstreamError::Body(err.to_string()))?;

        let headers = forwarded_headers(&parts.method, parts.headers);
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers().clone());

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response.headers_mut().remove(header::CONTENT_LENGTH);
        Ok(response)
    }
}

/// Request headers sent upstream. Reads drop `Accept-Encoding` so the body
/// comes back unencoded and one cache entry serves every client.
fn forwarded_headers(method: &Method, headers: HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(headers);
    if *method == Method::GET {
        headers.remove(header::ACCEPT_ENCODING);
    }
    headers
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

/// Fallback handler relaying every request to the upstream.
pub async fn forward(State(upstream): State<Upstream>, request: Request<Body>) -> Response {
    match upstream.forward(request).await {
        Ok(response) => response,
        Err(UpstreamError::Body(detail)) => HttpError::new(
            SOURCE,
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body rejected",
            detail,
        )
        .into_response(),
        Err(err) => {
            let status = match &err {
                UpstreamError::Http(inner) if inner.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            HttpError::from_error(SOURCE, status, "Upstream unavailable", &err).into_response()
        }
    }
}
