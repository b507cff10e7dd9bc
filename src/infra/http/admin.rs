//! Admin endpoints: stats, manual invalidation and the mutation webhook.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::error::ApiError;
use crate::application::cache_admin::CacheAdminService;
use crate::cache::OperationKind;

const SOURCE: &str = "infra::http::admin";

#[derive(Clone)]
pub struct AdminState {
    pub cache: CacheAdminService,
}

#[derive(Debug, Default, Deserialize)]
struct InvalidateRequest {
    route: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationRequest {
    operation_kind: Option<String>,
    collection_name: Option<String>,
}

/// Lenient body parsing: a missing or malformed body reads as "no fields".
fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

pub(super) async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub(super) async fn get_stats(State(state): State<AdminState>) -> Response {
    let stats = state.cache.get_stats().await;
    Json(json!({ "success": true, "data": stats })).into_response()
}

pub(super) async fn clear_cache(State(state): State<AdminState>) -> Response {
    Json(state.cache.clear_cache().await).into_response()
}

pub(super) async fn invalidate_route(
    State(state): State<AdminState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: InvalidateRequest = parse_body(&body);
    let outcome = state.cache.invalidate_route(request.route.as_deref()).await?;
    Ok(Json(outcome).into_response())
}

pub(super) async fn publish_event(
    State(state): State<AdminState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: MutationRequest = parse_body(&body);

    let kind = match request.operation_kind {
        Some(raw) => Some(
            serde_json::from_value::<OperationKind>(serde_json::Value::String(raw.clone()))
                .map_err(|_| {
                    ApiError::bad_request(SOURCE, format!("Unknown operationKind: {raw}"))
                })?,
        ),
        None => None,
    };

    let event = state
        .cache
        .publish_mutation(kind, request.collection_name.as_deref())
        .await?;

    let body = json!({
        "success": true,
        "message": format!("Accepted {} event for collection: {}", event.kind, event.collection),
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}
