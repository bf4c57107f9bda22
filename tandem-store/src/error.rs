//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection handle was quit and can no longer be used.
    #[error("Connection closed")]
    Closed,

    /// Command error.
    #[error("Command error: {0}")]
    Command(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,

    /// Pub/Sub error.
    #[error("Pub/Sub error: {0}")]
    PubSub(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout | Self::Io(_))
    }

    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Closed | Self::Timeout | Self::Io(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StoreError::Timeout.is_retryable());
        assert!(StoreError::Closed.is_connection_error());
        assert!(!StoreError::Closed.is_retryable());
        assert!(!StoreError::Command("WRONGTYPE".into()).is_connection_error());
        assert!(!StoreError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_io_errors_are_connection_errors() {
        let err: StoreError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("reset"));
    }
}
