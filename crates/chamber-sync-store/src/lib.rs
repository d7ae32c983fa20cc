//! Storage seams for chamber-sync.
//!
//! The sync engine never owns the transcript. It writes into a
//! [`SessionStore`] that renderers read from, forwards permission prompts to a
//! [`PermissionStore`], and records what the user has seen through a
//! [`ReadCursorSink`]. Full reloads come from a [`SessionSource`], usually the
//! server's HTTP API.
//!
//! [`MemoryStore`] implements the store traits in memory and is what the
//! command-line client and the tests use.
//!
//! # Example
//!
//! ```
//! use chamber_sync_core::{MessageInfo, SessionId};
//! use chamber_sync_store::{MemoryStore, SessionStore};
//!
//! let store = MemoryStore::new();
//! let info: MessageInfo = serde_json::from_str(
//!     r#"{"id":"msg_1","sessionID":"ses_1","role":"assistant"}"#,
//! ).unwrap();
//! store.update_message_info(info).unwrap();
//!
//! let session = SessionId::new("ses_1").unwrap();
//! assert_eq!(store.latest_assistant_id(&session).unwrap().as_str(), "msg_1");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod source;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::{MemoryReadCursors, MemoryStore};
pub use source::{load_sessions, refresh_session, SessionSource};
pub use types::{MessageParts, WriteOutcome};

use chamber_sync_core::{
    MessageId, MessageInfo, MessageRecord, Part, Permission, Role, SessionId, SessionInfo,
    Timestamp,
};

/// The transcript store shared between the sync engine and renderers.
///
/// Implementations are internally synchronized; the engine is the only
/// writer of message content.
pub trait SessionStore: Send + Sync {
    // =========================================================================
    // Reads
    // =========================================================================

    /// All messages of a session, ordered by id.
    fn messages(&self, session_id: &SessionId) -> Vec<MessageRecord>;

    /// One message, if present.
    fn message(&self, session_id: &SessionId, message_id: &MessageId) -> Option<MessageRecord>;

    /// Session metadata, if present.
    fn session(&self, session_id: &SessionId) -> Option<SessionInfo>;

    /// The greatest assistant message id held for the session.
    fn latest_assistant_id(&self, session_id: &SessionId) -> Option<MessageId>;

    // =========================================================================
    // Message writes
    // =========================================================================

    /// Insert or replace a message header, creating the record if absent.
    ///
    /// Existing parts are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn update_message_info(&self, info: MessageInfo) -> Result<WriteOutcome>;

    /// Insert or replace one part, creating the owning record with `role` if
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn add_streaming_part(&self, part: Part, role: Role) -> Result<WriteOutcome>;

    /// Apply one frame of buffered parts as a single commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn commit_streaming_parts(&self, batch: &[MessageParts]) -> Result<WriteOutcome>;

    /// Stamp the completion time of a message if it has none.
    ///
    /// Returns false if the message is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn complete_streaming_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        completed_at: Timestamp,
    ) -> Result<bool>;

    /// Drop a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn remove_message(&self, session_id: &SessionId, message_id: &MessageId) -> Result<bool>;

    /// Replace the whole message list of a session.
    ///
    /// Returns the ids that were held before and are gone now.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn replace_messages(
        &self,
        session_id: &SessionId,
        messages: Vec<MessageRecord>,
    ) -> Result<Vec<MessageId>>;

    // =========================================================================
    // Session writes
    // =========================================================================

    /// Merge title, summary, and timestamps into the session record.
    ///
    /// Returns true if anything visible changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn apply_session_metadata(&self, info: &SessionInfo) -> Result<bool>;

    /// Record that the session history was compacted at `at`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::SessionNotFound` if the session is unknown.
    fn update_session_compaction(&self, session_id: &SessionId, at: Timestamp) -> Result<()>;

    /// Replace the session list.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn replace_sessions(&self, sessions: Vec<SessionInfo>) -> Result<()>;
}

/// Receives permission prompts for the active session.
pub trait PermissionStore: Send + Sync {
    /// Record a pending permission, replacing one with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    fn add_permission(&self, permission: Permission) -> Result<()>;

    /// Pending permissions of a session, in arrival order.
    fn pending_permissions(&self, session_id: &SessionId) -> Vec<Permission>;
}

/// Persists the last message the user has seen in each session.
pub trait ReadCursorSink: Send + Sync {
    /// Mark `message_id` as read in `session_id` at time `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be persisted.
    fn mark_read(&self, session_id: &SessionId, message_id: &MessageId, at: Timestamp)
        -> Result<()>;
}
