//! Error types for the cellrun HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Errors the HTTP handlers can return; wraps `cellrun_core::Error` and adds
/// the handful of HTTP-surface-only cases (bad request bodies, missing
/// routes the core doesn't know about).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The execution core rejected the submission synchronously (console
    /// busy, queue closed).
    #[error(transparent)]
    Core(#[from] cellrun_core::Error),

    /// The request body failed validation before it ever reached the core
    /// (e.g. a file-run path that doesn't end in `.py`).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// IO failure outside of process execution (e.g. writing an uploaded
    /// file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Core(cellrun_core::Error::ConsoleBusy) => StatusCode::CONFLICT,
            ServerError::Core(cellrun_core::Error::QueueClosed) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({"error": self.to_string()}));
        (status, body).into_response()
    }
}
