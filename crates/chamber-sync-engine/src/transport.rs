//! Transport seam.
//!
//! A transport delivers server events into the runtime. The default is the
//! server's SSE endpoint; desktop hosts can plug in a native bridge that also
//! reports explicit message completion and session activity.
//!
//! Every subscription gets a fresh [`SubscriptionId`]. The runtime drops
//! messages tagged with an id that is no longer current, so a late callback
//! from a torn-down subscription cannot touch state.

use std::fmt;

use async_trait::async_trait;
use chamber_sync_core::{ActivityPhase, MessageId, SessionId, StreamEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Which kind of transport is feeding the engine.
///
/// Native transports get the stricter shrink guard and deferred completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Server-sent events from the HTTP server.
    Web,
    /// A desktop bridge relaying events from a local process.
    Native,
}

/// Identifies one subscription attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Wrap a raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a transport can report.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// The stream is open.
    Open,
    /// A server event.
    Event(StreamEvent),
    /// The stream failed; the subscription is dead.
    Error(TransportError),
    /// The bridge saw a message finish.
    MessageComplete {
        /// Session of the message.
        session_id: SessionId,
        /// The finished message.
        message_id: MessageId,
    },
    /// The bridge saw a session change phase.
    SessionActivity {
        /// Session.
        session_id: SessionId,
        /// New phase.
        phase: ActivityPhase,
    },
}

/// Callback handle given to a transport on subscribe.
///
/// Cheap to clone. Every send is tagged with the subscription id. Sends return
/// false once the runtime is gone, which transports use as a stop signal.
#[derive(Debug, Clone)]
pub struct TransportSink {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<(SubscriptionId, TransportMessage)>,
}

impl TransportSink {
    /// Create a sink for subscription `id`.
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        tx: mpsc::UnboundedSender<(SubscriptionId, TransportMessage)>,
    ) -> Self {
        Self { id, tx }
    }

    /// The subscription this sink reports for.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns true if the receiving side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Report a raw message.
    pub fn send(&self, message: TransportMessage) -> bool {
        self.tx.send((self.id, message)).is_ok()
    }

    /// Report that the stream opened.
    pub fn open(&self) -> bool {
        self.send(TransportMessage::Open)
    }

    /// Report an event.
    pub fn event(&self, event: StreamEvent) -> bool {
        self.send(TransportMessage::Event(event))
    }

    /// Report a fault.
    pub fn error(&self, error: TransportError) -> bool {
        self.send(TransportMessage::Error(error))
    }

    /// Report an explicit completion signal.
    pub fn message_complete(&self, session_id: SessionId, message_id: MessageId) -> bool {
        self.send(TransportMessage::MessageComplete {
            session_id,
            message_id,
        })
    }

    /// Report a session activity phase.
    pub fn session_activity(&self, session_id: SessionId, phase: ActivityPhase) -> bool {
        self.send(TransportMessage::SessionActivity { session_id, phase })
    }
}

/// A live subscription.
///
/// `unsubscribe` consumes the handle, so it runs at most once.
pub trait Subscription: Send {
    /// Stop delivering events.
    fn unsubscribe(self: Box<Self>);
}

/// A subscription backed by a spawned task and a cancellation token.
#[derive(Debug)]
pub struct TaskSubscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskSubscription {
    /// Wrap a task that watches `cancel`.
    #[must_use]
    pub fn new(cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { cancel, handle }
    }
}

impl Subscription for TaskSubscription {
    fn unsubscribe(self: Box<Self>) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Source of server events.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind.
    fn kind(&self) -> TransportKind;

    /// Start delivering events to `sink`.
    fn subscribe(&self, sink: TransportSink) -> Box<dyn Subscription>;

    /// Lightweight health probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe itself could not be made.
    async fn check_health(&self) -> Result<bool, TransportError>;

    /// Scope future subscriptions to a working directory.
    fn set_directory(&self, _directory: Option<String>) {}
}
