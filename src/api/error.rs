//! [`FreeTierError`] to HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::FreeTierError;

impl FreeTierError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FreeTierError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        // Internal details stay in the log.
        let message = match &self {
            Self::InvalidInput(_) => self.to_string(),
            Self::DependencyUnavailable(_) => "service temporarily unavailable, retry later".into(),
            Self::Config(_) | Self::Io(_) => "internal error".into(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
