//! Error types for Turnstile.

use thiserror::Error;

/// A storage operation could not be completed.
///
/// This is the only error a [`Storage`](crate::storage::Storage) backend surfaces:
/// connection loss, timeouts and malformed replies all collapse into it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("backend unavailable: {reason}")]
pub struct BackendUnavailable {
    reason: String,
}

impl BackendUnavailable {
    /// Create a new error with a human readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason reported by the backend.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limit, window or backend connection string
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The requested strategy is not registered
    #[error("unknown rate limiting strategy: {0}")]
    UnknownStrategy(String),

    /// A storage backend failed
    #[error(transparent)]
    BackendUnavailable(#[from] BackendUnavailable),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
