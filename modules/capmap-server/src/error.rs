//! Translation from domain errors to HTTP responses. Raw store errors are
//! never echoed to clients; list endpoints always produce well-formed JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use capmap_common::CapMapError;

pub struct ApiError(pub CapMapError);

impl From<CapMapError> for ApiError {
    fn from(e: CapMapError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            CapMapError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            CapMapError::NotFound(_) => (
                StatusCode::OK,
                Json(serde_json::json!({ "found": false })),
            )
                .into_response(),
            CapMapError::Store(e) => {
                tracing::warn!(error = %e, "Store error surfaced to client as 503");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "service temporarily unavailable" })),
                )
                    .into_response()
            }
            other => {
                tracing::warn!(error = %other, "Unexpected error surfaced to client as 503");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "service temporarily unavailable" })),
                )
                    .into_response()
            }
        }
    }
}
