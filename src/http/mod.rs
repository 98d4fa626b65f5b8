//! HTTP surface for the rate limiter.

mod forward;
mod handlers;
mod server;

pub use forward::LogForwarder;
pub use handlers::{create_router, AppState};
pub use server::HttpServer;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors returned by HTTP handlers as `{"error": "..."}` bodies.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or wrong API key (401)
    Unauthorized(String),
    /// The bucket store could not be reached (503)
    ServiceUnavailable(String),
    /// Anything else that failed inside the service (500)
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
