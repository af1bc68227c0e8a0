//! Fablestep: API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fablestep_core::error::DomainError;
use serde::Serialize;
use thiserror::Error;

/// Startup and runtime errors for the API server.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The language model client could not be built.
    #[error("llm client error: {0}")]
    Llm(#[from] fablestep_llm::LlmError),

    /// Span export could not be set up.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// JSON body returned for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub error: &'static str,
    /// Human-readable error message.
    pub message: String,
    /// Whether resubmitting can succeed.
    pub retryable: bool,
}

/// HTTP-layer wrapper around `DomainError` that implements `IntoResponse`.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self(err)
    }
}

/// HTTP status for a domain error.
#[must_use]
pub fn status_for(err: &DomainError) -> StatusCode {
    match err {
        DomainError::SessionNotFound(_) | DomainError::StoryNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        DomainError::MissingIdempotencyKey | DomainError::Validation(_) => StatusCode::BAD_REQUEST,
        DomainError::InputConflict
        | DomainError::InvalidChoice(_)
        | DomainError::ChoiceLocked(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DomainError::RequestInProgress(_)
        | DomainError::IdempotencyKeyReused(_)
        | DomainError::ConcurrencyConflict { .. }
        | DomainError::SessionNotActive(_) => StatusCode::CONFLICT,
        DomainError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DomainError::StreamAborted | DomainError::Infrastructure(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }

        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };

        (status, Json(body)).into_response()
    }
}
