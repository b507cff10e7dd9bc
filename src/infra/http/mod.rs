mod admin;
mod error;
mod middleware;
mod upstream;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

pub use admin::AdminState;
pub use error::{ApiError, ApiErrorBody};
pub use middleware::{
    RequestContext, expose_cache_headers, log_responses, publish_mutations, set_request_context,
};
pub use upstream::{Upstream, UpstreamError, forward};

use crate::cache::{CacheState, MutationHub, response_cache_layer};

/// Public router: wrap `downstream` with the write observer and response cache.
///
/// Layers run outermost first: request context, response logging, write
/// observer, CORS header exposure, cache, then the downstream routes.
pub fn cache_router(downstream: Router, cache: CacheState, hub: Arc<MutationHub>) -> Router {
    downstream
        .layer(axum_middleware::from_fn_with_state(
            cache,
            response_cache_layer,
        ))
        .layer(axum_middleware::from_fn(expose_cache_headers))
        .layer(axum_middleware::from_fn_with_state(hub, publish_mutations))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Public router for the binary: every request is proxied to `upstream`.
pub fn build_router(upstream: Upstream, cache: CacheState, hub: Arc<MutationHub>) -> Router {
    let downstream = Router::new().fallback(forward).with_state(upstream);
    cache_router(downstream, cache, hub)
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_health", get(admin::health))
        .route("/cache/stats", get(admin::get_stats))
        .route("/cache/clear", post(admin::clear_cache))
        .route("/cache/invalidate", post(admin::invalidate_route))
        .route("/cache/events", post(admin::publish_event))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
