//! Lock error types.

use tandem_store::StoreError;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Distributed lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to acquire lock '{resource}' after {attempts} attempts")]
    AcquireFailed { resource: String, attempts: u32 },

    #[error("Lock not held: {0}")]
    NotHeld(String),

    #[error("Invalid lease settings: {0}")]
    InvalidSettings(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_connection_error())
    }
}
