use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::{cache_admin::CacheAdminError, error::ErrorReport};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub success: bool,
    pub error: String,
}

/// JSON error for the admin surface: `{"success": false, "error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    source: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, source: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            source,
            message: message.into(),
        }
    }

    pub fn bad_request(source: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, source, message)
    }
}

impl From<CacheAdminError> for ApiError {
    fn from(error: CacheAdminError) -> Self {
        match error {
            CacheAdminError::Validation(message) => {
                Self::bad_request("application::cache_admin", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            success: false,
            error: self.message.clone(),
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(self.source, self.status, self.message).attach(&mut response);
        response
    }
}
