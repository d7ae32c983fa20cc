//! Error types for the storage layer.

use chamber_sync_core::SessionId;
use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The session is not known to the store.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A remote source failed to produce data.
    #[error("source error: {0}")]
    Source(String),

    /// Writing to a backing medium failed.
    #[error("storage error: {0}")]
    Storage(String),
}
