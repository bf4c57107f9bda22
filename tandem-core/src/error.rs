//! Error types for coordinator operations.

use tandem_lock::LockError;
use tandem_store::StoreError;
use thiserror::Error;

/// Boxed error returned by a `with_lock` transform.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, TandemError>;

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum TandemError {
    /// Transport failure talking to the store
    #[error("Connection error: {0}")]
    Connection(#[source] StoreError),

    /// The lease primitive ran out of attempts
    #[error("Failed to acquire lock '{key}' after {attempts} attempts")]
    LockAcquisition { key: String, attempts: u32 },

    /// The channel already has an active subscription
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Malformed stored or received payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A `with_lock` transform failed; the lock was released and nothing persisted
    #[error("Transform failed for '{key}': {source}")]
    Transform {
        key: String,
        #[source]
        source: BoxError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TandemError {
    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(e) if e.is_connection_error())
    }

    /// Check if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::LockAcquisition { .. } => true,
            _ => false,
        }
    }
}

impl From<StoreError> for TandemError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Config(msg) => Self::Config(msg),
            other => Self::Connection(other),
        }
    }
}

impl From<LockError> for TandemError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AcquireFailed { resource, attempts } => Self::LockAcquisition {
                key: resource
                    .strip_prefix(&format!("{}:", tandem_lock::LOCK_PREFIX))
                    .unwrap_or(&resource)
                    .to_string(),
                attempts,
            },
            LockError::Store(e) => e.into(),
            LockError::InvalidSettings(msg) => Self::Config(msg),
            // Release failures never leave the lock manager.
            LockError::NotHeld(resource) => {
                Self::Connection(StoreError::Command(format!("lock not held: {}", resource)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_map_to_caller_key() {
        let err: TandemError = LockError::AcquireFailed {
            resource: "lock:orders".to_string(),
            attempts: 41,
        }
        .into();

        match err {
            TandemError::LockAcquisition { key, attempts } => {
                assert_eq!(key, "orders");
                assert_eq!(attempts, 41);
            }
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_store_config_error_is_config() {
        let err: TandemError = StoreError::Config("bad url".into()).into();
        assert!(matches!(err, TandemError::Config(_)));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_classification() {
        let err: TandemError = StoreError::Timeout.into();
        assert!(err.is_connection_error());
        assert!(err.is_retryable());
        assert!(!TandemError::AlreadySubscribed("c".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = TandemError::AlreadySubscribed("news".to_string());
        assert!(err.to_string().contains("news"));
    }
}
