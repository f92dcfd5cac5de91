pub mod api_routes;
pub mod stream_routes;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::AppError;

const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity, as asserted by the auth gateway in front of us.
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| error_response(&AppError::Unauthorized))
    }
}

/// JSON `{"error": ...}` with a status derived from the error class.
/// Internal failures are logged and rendered opaquely.
pub fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_forbidden() {
        StatusCode::FORBIDDEN
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_lineage() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        match err {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };

    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {err}");
        "An unexpected error occurred".to_string()
    } else {
        err.to_string()
    };

    (status, Json(json!({ "error": message }))).into_response()
}
