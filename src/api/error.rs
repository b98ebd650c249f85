//! HTTP rendering of [`AppError`].

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::api::ErrorBody;
use crate::AppError;

/// Seconds a client should wait before retrying a busy or full gateway.
const RETRY_AFTER_SECONDS: &str = "1";

impl AppError {
    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Busy(_) => StatusCode::CONFLICT,
            Self::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_)
            | Self::Cancelled(_)
            | Self::Transport(_)
            | Self::Protocol(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing explanation, without the kind prefix.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Transport(msg) => format!("Error executing code: {msg}"),
            Self::Config(msg)
            | Self::Validation(msg)
            | Self::NotFound(msg)
            | Self::Busy(msg)
            | Self::Capacity(msg)
            | Self::Timeout(msg)
            | Self::Cancelled(msg)
            | Self::Protocol(msg)
            | Self::Io(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let mut response = (status, Json(ErrorBody { detail: self.detail() })).into_response();
        if self.is_retryable() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECONDS),
            );
        }
        response
    }
}
