//! Error types for the delivery engine.
//!
//! Expected delivery outcomes (HTTP failures, timeouts, open circuits,
//! rate limiting) are not errors: they travel as `HandlerOutcome` and
//! `DeliveryResult` values. `DeliveryError` covers what callers of the
//! engine's own API can observe: storage failures, lifecycle misuse,
//! configuration problems and startup failures.

use std::fmt;

use hookrelay_core::{CoreError, DeadLetterId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors surfaced by the delivery engine's API.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// A storage collaborator failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Webhook or component configuration is unusable.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// The processor could not start.
    #[error("startup failed: {message}")]
    StartupFailed {
        /// Reason startup was aborted
        message: String,
    },

    /// A lifecycle operation was called in the wrong state.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires
        expected: String,
        /// State the component was in
        actual: String,
    },

    /// No dead-letter record with the given ID exists.
    #[error("dead letter entry {id} not found")]
    DeadLetterNotFound {
        /// The missing entry
        id: DeadLetterId,
    },

    /// The HTTP client could not be built.
    #[error("http client error: {message}")]
    HttpClient {
        /// Client error message
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a startup error.
    pub fn startup(message: impl Into<String>) -> Self {
        Self::StartupFailed { message: message.into() }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::InvalidState { expected: expected.to_string(), actual: actual.to_string() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Returns true for failures that may succeed if the operation is
    /// repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. } | Self::StartupFailed { .. } => true,

            Self::ConfigurationError { .. }
            | Self::InvalidState { .. }
            | Self::DeadLetterNotFound { .. }
            | Self::HttpClient { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}
