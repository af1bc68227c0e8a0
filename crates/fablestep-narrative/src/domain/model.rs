//! Tagged outcome of a language model call.
//!
//! Adapters never raise; they classify every failure as retryable or fatal
//! and the pipeline branches on the tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network failure or timeout.
pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
/// The model answered with something that does not parse.
pub const MALFORMED_OUTPUT: &str = "MALFORMED_OUTPUT";
/// The mapping named a target outside the allow-list.
pub const TARGET_NOT_ALLOWED: &str = "TARGET_NOT_ALLOWED";
/// The model answered with no usable text.
pub const EMPTY_OUTPUT: &str = "EMPTY_OUTPUT";
/// The provider refused the request (auth, quota, bad request).
pub const UPSTREAM_REJECTED: &str = "UPSTREAM_REJECTED";

/// Classified model failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ModelFailure {
    /// Stable failure code.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl ModelFailure {
    /// Creates a failure with the given code.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

/// Result of a model call.
#[derive(Debug)]
pub enum ModelOutcome<T> {
    /// The call produced a payload.
    Ok(T),
    /// The call failed but may succeed if repeated.
    RetryableFailure(ModelFailure),
    /// The call failed and repeating it will not help.
    FatalFailure(ModelFailure),
}

impl<T> ModelOutcome<T> {
    /// Maps the payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ModelOutcome<U> {
        match self {
            Self::Ok(value) => ModelOutcome::Ok(f(value)),
            Self::RetryableFailure(failure) => ModelOutcome::RetryableFailure(failure),
            Self::FatalFailure(failure) => ModelOutcome::FatalFailure(failure),
        }
    }

    /// Collapses both failure kinds, for callers that fail fast on either.
    ///
    /// # Errors
    ///
    /// Returns the failure of either kind.
    pub fn into_result(self) -> Result<T, ModelFailure> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::RetryableFailure(failure) | Self::FatalFailure(failure) => Err(failure),
        }
    }
}
