use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    application::error::ErrorReport,
    cache::{
        HEADER_CACHE, HEADER_CACHE_KEY, HEADER_CACHE_STORED, HEADER_CACHE_TTL, MutationEvent,
        MutationHub, OperationKind,
    },
};

const EXPOSED_CACHE_HEADERS: [&str; 4] = [
    HEADER_CACHE,
    HEADER_CACHE_KEY,
    HEADER_CACHE_TTL,
    HEADER_CACHE_STORED,
];

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "readthrough::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "readthrough::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "client request error",
            );
        }
    }

    response
}

/// Append the cache headers to `Access-Control-Expose-Headers` on CORS
/// responses so browser clients can read them.
pub async fn expose_cache_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    if !response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
    {
        return response;
    }

    let exposed = merged_expose_headers(
        response
            .headers()
            .get(header::ACCESS_CONTROL_EXPOSE_HEADERS)
            .and_then(|value| value.to_str().ok()),
    );
    if let Ok(value) = HeaderValue::from_str(&exposed) {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
    }
    response
}

fn merged_expose_headers(existing: Option<&str>) -> String {
    let mut names: Vec<String> = existing
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    // `*` already exposes everything.
    if names.iter().any(|name| name == "*") {
        return names.join(", ");
    }

    for cache_header in EXPOSED_CACHE_HEADERS {
        if !names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(cache_header))
        {
            names.push(cache_header.to_string());
        }
    }
    names.join(", ")
}

/// Mutation kind and collection for a write under `/api/<collection>`.
fn observed_write(method: &Method, path: &str) -> Option<(OperationKind, String)> {
    let kind = match *method {
        Method::POST => OperationKind::Create,
        Method::PUT | Method::PATCH => OperationKind::Update,
        Method::DELETE => OperationKind::Delete,
        _ => return None,
    };

    let collection = path.strip_prefix("/api/")?.split('/').next()?;
    if collection.is_empty() {
        return None;
    }

    Some((kind, collection.to_string()))
}

/// Publish a mutation event for every successful write passing through.
///
/// The event is delivered before the response is returned, so a client that
/// reads right after its own write never sees the stale entry.
pub async fn publish_mutations(
    State(hub): State<Arc<MutationHub>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let write = observed_write(request.method(), request.uri().path());
    let response = next.run(request).await;

    if let Some((kind, collection)) = write {
        if response.status().is_success() {
            let delivered = hub.publish(MutationEvent::new(kind, collection.as_str())).await;
            debug!(kind = %kind, collection = %collection, delivered, "observed write");
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_write_maps_methods() {
        assert_eq!(
            observed_write(&Method::POST, "/api/products"),
            Some((OperationKind::Create, "products".to_string()))
        );
        assert_eq!(
            observed_write(&Method::PUT, "/api/products/7"),
            Some((OperationKind::Update, "products".to_string()))
        );
        assert_eq!(
            observed_write(&Method::PATCH, "/api/products/7"),
            Some((OperationKind::Update, "products".to_string()))
        );
        assert_eq!(
            observed_write(&Method::DELETE, "/api/categories/3"),
            Some((OperationKind::Delete, "categories".to_string()))
        );
    }

    #[test]
    fn expose_headers_are_merged_once() {
        assert_eq!(
            merged_expose_headers(None),
            "x-cache, x-cache-key, x-cache-ttl, x-cache-stored"
        );
        assert_eq!(
            merged_expose_headers(Some("X-Total-Count, X-Cache")),
            "X-Total-Count, X-Cache, x-cache-key, x-cache-ttl, x-cache-stored"
        );
        assert_eq!(merged_expose_headers(Some("*")), "*");
    }

    #[test]
    fn observed_write_ignores_reads_and_foreign_paths() {
        assert_eq!(observed_write(&Method::GET, "/api/products"), None);
        assert_eq!(observed_write(&Method::POST, "/admin/products"), None);
        assert_eq!(observed_write(&Method::POST, "/api/"), None);
        assert_eq!(observed_write(&Method::POST, "/apiary"), None);
    }
}
