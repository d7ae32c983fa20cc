//! Error types for the sync engine.
//!
//! Transport faults are never fatal: the connection manager turns them into a
//! reconnect and a status hint. `EngineError` is what callers of the
//! [`SyncHandle`](crate::runtime::SyncHandle) can see.

use thiserror::Error;

/// A result type using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in sync engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] chamber_sync_store::StoreError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The runtime task has exited.
    #[error("sync runtime has shut down")]
    Shutdown,
}

/// Faults reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The stream failed after it was open.
    #[error("stream read failed: {0}")]
    Stream(String),

    /// The server closed the stream.
    #[error("stream closed by server")]
    Closed,
}

impl TransportError {
    /// Returns true if the fault happened before the stream opened.
    #[must_use]
    pub const fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Status(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_messages() {
        assert_eq!(TransportError::Status(502).to_string(), "unexpected HTTP status 502");
        assert!(TransportError::Connect("refused".into()).is_connect_failure());
        assert!(!TransportError::Closed.is_connect_failure());
        let err: EngineError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: stream closed by server");
    }
}
