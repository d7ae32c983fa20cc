//! Value types exchanged with a session store.

use chamber_sync_core::{MessageId, Part, Role, SessionId};

/// All parts buffered for one message during a display frame.
///
/// A frame's worth of streaming updates is handed to the store as a slice of
/// these, one entry per `(session, message)` pair, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageParts {
    /// Owning session.
    pub session_id: SessionId,
    /// Owning message.
    pub message_id: MessageId,
    /// Author of the message, used when the store has not seen it yet.
    pub role: Role,
    /// Part snapshots in arrival order. A later snapshot of the same part id
    /// replaces an earlier one.
    pub parts: Vec<Part>,
}

impl MessageParts {
    /// Create an empty group.
    #[must_use]
    pub fn new(session_id: SessionId, message_id: MessageId, role: Role) -> Self {
        Self {
            session_id,
            message_id,
            role,
            parts: Vec::new(),
        }
    }
}

/// Result of a store write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Messages that did not exist before the write.
    pub created: Vec<MessageId>,
    /// Parts that did not exist before the write.
    pub new_parts: usize,
    /// Messages dropped from a session's window to make room.
    pub evicted: Vec<MessageId>,
}

impl WriteOutcome {
    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: Self) {
        self.created.extend(other.created);
        self.new_parts += other.new_parts;
        self.evicted.extend(other.evicted);
    }
}
