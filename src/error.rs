use crate::systemd::client::{ControlFailure, SystemdError};
use crate::systemd::journal::JournalError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced to HTTP clients
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Systemd(#[from] SystemdError),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Journal(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Systemd(SystemdError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Systemd(SystemdError::Control { failure, .. }) => match failure {
                ControlFailure::NoSuchUnit => StatusCode::NOT_FOUND,
                ControlFailure::AccessDenied => StatusCode::FORBIDDEN,
                ControlFailure::TimedOut => StatusCode::GATEWAY_TIMEOUT,
                ControlFailure::Rejected => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Journal(_) => "source_unavailable",
            ApiError::Systemd(SystemdError::Unavailable(_)) => "service_manager_unavailable",
            ApiError::Systemd(SystemdError::Control { .. }) => "control_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, "{}", self);
        } else {
            tracing::debug!(%status, "{}", self);
        }

        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
