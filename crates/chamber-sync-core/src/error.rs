//! Common error types for chamber-sync.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised while decoding server data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A known event type arrived with a payload that does not fit its schema.
    #[error("malformed {kind} event: {reason}")]
    MalformedEvent {
        /// The event type.
        kind: String,
        /// What failed to decode.
        reason: String,
    },

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// The input was not valid JSON, or not an event object.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
