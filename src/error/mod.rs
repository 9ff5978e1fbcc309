use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::queue::{QueueEvent, QueueState};

/// Errors raised synchronously by the queue layer.
///
/// Runtime conditions (capacity rejection, concurrent drain, delivery
/// failure, expiry) are reported through return values and counters, not
/// through this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Contract violation by the producer
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A live queue already exists for this connection
    #[error("Queue already registered for connection {0}")]
    AlreadyRegistered(String),

    /// The state machine refused an event
    #[error("Invalid queue transition from {from} on {event:?}")]
    InvalidTransition { from: QueueState, event: QueueEvent },
}

impl QueueError {
    pub(crate) fn invalid_transition(from: QueueState, event: QueueEvent) -> Self {
        Self::InvalidTransition { from, event }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidMessage(msg) => AppError::Validation(msg),
            QueueError::AlreadyRegistered(_) => AppError::Conflict(err.to_string()),
            QueueError::InvalidTransition { .. } => AppError::Internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Config(e) => {
                let message = if is_production() {
                    "Configuration error".to_string()
                } else {
                    e.to_string()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", message)
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Internal(msg) => {
                let message = if is_production() {
                    "Internal server error".to_string()
                } else {
                    msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message) = self.parts();

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %self,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_mapping() {
        let err: AppError = QueueError::InvalidMessage("payload is null".into()).into();
        assert!(matches!(err, AppError::Validation(_)));

        let err: AppError = QueueError::AlreadyRegistered("conn-1".into()).into();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotFound("x".into()).parts().0, StatusCode::NOT_FOUND);
        assert_eq!(AppError::Conflict("x".into()).parts().0, StatusCode::CONFLICT);
        assert_eq!(
            AppError::Validation("x".into()).parts().0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = QueueError::invalid_transition(QueueState::Closed, QueueEvent::DrainStarted);
        assert_eq!(
            err.to_string(),
            "Invalid queue transition from CLOSED on DrainStarted"
        );
    }
}
