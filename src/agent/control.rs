use http::StatusCode;

use crate::error::{SessionError, ValidationError};

/// A failed control request: HTTP status, machine-readable kind, message.
#[derive(Debug)]
pub(super) struct ControlError {
    pub(super) status: StatusCode,
    pub(super) kind: &'static str,
    pub(super) message: String,
}

impl ControlError {
    pub(super) fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub(super) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub(super) fn too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", message)
    }

    pub(super) fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
    }

    pub(super) fn not_found(method: &str, path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No route for {} {}", method, path),
        )
    }

    pub(super) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<ValidationError> for ControlError {
    fn from(error: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", error.to_string())
    }
}

impl From<SessionError> for ControlError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Conflict { .. } | SessionError::Capacity { .. } => {
                Self::new(StatusCode::CONFLICT, "conflict", error.to_string())
            }
            SessionError::Spawn { .. }
            | SessionError::ExitedImmediately { .. }
            | SessionError::MissingStdout { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "spawn", error.to_string())
            }
        }
    }
}
