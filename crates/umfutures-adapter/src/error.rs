/*
[INPUT]:  Error sources (driver transport, serialization, validation)
[OUTPUT]: Structured error types with context and retry hints
[POS]:    Error handling layer - unified error types for the adapter
[UPDATE]: When adding new error sources or improving error messages
*/

use thiserror::Error;

/// Main error type for the exchange driver surface.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport-level failure (socket closed, send failed)
    #[error("transport error: {0}")]
    Transport(String),

    /// Venue returned an error response
    #[error("venue error (code {code}): {message}")]
    Venue { code: i64, message: String },

    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request was malformed before it reached the wire
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Driver is shutting down and no longer accepts operations
    #[error("driver is shut down")]
    Shutdown,

    /// Operation timed out
    #[error("operation timed out after {duration}s")]
    Timeout { duration: u64 },
}

impl DriverError {
    /// Check if the error is retryable on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(_) | DriverError::Timeout { .. }
        )
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
