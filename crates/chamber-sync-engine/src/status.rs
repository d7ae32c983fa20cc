//! Connection status publication.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

/// State of the live event stream, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not started, or torn down.
    #[default]
    Idle,
    /// First subscription attempt in flight.
    Connecting,
    /// Stream is open.
    Connected,
    /// Waiting for, or making, a retry.
    Reconnecting,
    /// Host is in the background; no connection is allowed.
    Paused,
    /// Network is down.
    Offline,
    /// The transport reported a fault.
    Error,
}

impl ConnectionStatus {
    /// Wire/display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Paused => "paused",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status together with its optional hint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    /// Current status.
    pub status: ConnectionStatus,
    /// Human-readable explanation, e.g. the last transport error.
    pub hint: Option<String>,
}

/// Receives connection status changes.
pub trait StatusSink: Send + Sync {
    /// Publish a status and hint.
    fn set_event_stream_status(&self, status: ConnectionStatus, hint: Option<String>);
}

/// A [`StatusSink`] backed by a `tokio::sync::watch` channel.
///
/// Receivers only wake when the status or hint actually changes.
#[derive(Debug)]
pub struct WatchStatusSink {
    tx: watch::Sender<StatusUpdate>,
}

impl WatchStatusSink {
    /// Create a sink starting at `Idle`, with its first receiver.
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<StatusUpdate>) {
        let (tx, rx) = watch::channel(StatusUpdate::default());
        (Self { tx }, rx)
    }

    /// Create another receiver.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }

    /// The latest published value.
    #[must_use]
    pub fn current(&self) -> StatusUpdate {
        self.tx.borrow().clone()
    }
}

impl StatusSink for WatchStatusSink {
    fn set_event_stream_status(&self, status: ConnectionStatus, hint: Option<String>) {
        self.tx.send_if_modified(|current| {
            if current.status == status && current.hint == hint {
                return false;
            }
            *current = StatusUpdate { status, hint };
            true
        });
    }
}
