//! Message, part, and session model shared by the store and the engine.
//!
//! Field names follow the server's JSON schema (`sessionID`, `messageID`,
//! `type`), so these types deserialize straight out of event properties.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{MessageId, PartId, PermissionId, SessionId};

/// Unix epoch milliseconds.
pub type Timestamp = u64;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Part type carrying assistant or user text.
pub const PART_TEXT: &str = "text";
/// Part type carrying a tool invocation.
pub const PART_TOOL: &str = "tool";
/// Part type closing one generation step.
pub const PART_STEP_FINISH: &str = "step-finish";

/// Author of a message.
///
/// Unknown role strings are read as `Assistant`, matching how the client
/// treats any message it did not author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    /// Message typed by the user.
    User,
    /// Message produced by the agent.
    #[default]
    Assistant,
}

impl Role {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("user") {
            Self::User
        } else {
            Self::Assistant
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

/// Creation and completion times of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    /// When the server created the message.
    #[serde(default)]
    pub created: Timestamp,
    /// When generation finished, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<Timestamp>,
}

/// Message header as carried by `message.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Message identifier.
    pub id: MessageId,
    /// Owning session.
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    /// Author.
    #[serde(default)]
    pub role: Role,
    /// Timestamps.
    #[serde(default)]
    pub time: MessageTime,
    /// Finish reason reported once generation stopped (`stop`, `length`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    /// Lifecycle status string (`pending`, `completed`, `error`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Error payload for failed generations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl MessageInfo {
    /// Create a header with no timestamps or status.
    #[must_use]
    pub fn new(id: MessageId, session_id: SessionId, role: Role) -> Self {
        Self {
            id,
            session_id,
            role,
            time: MessageTime::default(),
            finish: None,
            status: None,
            error: None,
        }
    }

    /// Returns true if the status string is one of the terminal states.
    #[must_use]
    pub fn has_terminal_status(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed" | "error" | "aborted")
        )
    }

    /// Returns true if this header claims the message is done, either by a
    /// completion timestamp or a terminal status.
    #[must_use]
    pub fn signals_completion(&self) -> bool {
        self.time.completed.is_some() || self.has_terminal_status()
    }
}

/// One part of a message: a text chunk, a tool call, a step marker, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Part identifier.
    pub id: PartId,
    /// Owning session.
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    /// Owning message.
    #[serde(rename = "messageID")]
    pub message_id: MessageId,
    /// Part type (`text`, `reasoning`, `tool`, `step-start`, `step-finish`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Text content for text-like parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Injected by the server rather than typed by a person.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    /// Step-finish reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Everything else the server sent (tool state, timings, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    /// Returns true for `text` parts.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.kind == PART_TEXT
    }

    /// Returns true for tool parts.
    #[must_use]
    pub fn is_tool(&self) -> bool {
        self.kind == PART_TOOL
    }

    /// Returns true for a `step-finish` part whose reason is `stop`, the
    /// server's marker that generation is over.
    #[must_use]
    pub fn is_finish_marker(&self) -> bool {
        self.kind == PART_STEP_FINISH && self.reason.as_deref() == Some("stop")
    }

    /// Number of characters of text in a text part; zero for other kinds.
    #[must_use]
    pub fn text_len(&self) -> usize {
        if self.is_text() {
            self.text.as_deref().map_or(0, |t| t.chars().count())
        } else {
            0
        }
    }
}

/// A message header together with its parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Header.
    pub info: MessageInfo,
    /// Parts in arrival order.
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl MessageRecord {
    /// Create a record with no parts.
    #[must_use]
    pub fn new(info: MessageInfo) -> Self {
        Self {
            info,
            parts: Vec::new(),
        }
    }

    /// Message id shortcut.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.info.id
    }

    /// Total characters across text parts.
    #[must_use]
    pub fn text_len(&self) -> usize {
        text_len(&self.parts)
    }

    /// Returns true if any part is a finish marker.
    #[must_use]
    pub fn has_finish_marker(&self) -> bool {
        has_finish_marker(&self.parts)
    }

    /// Returns true if the message shows anything worth displaying.
    #[must_use]
    pub fn has_meaningful_content(&self) -> bool {
        has_meaningful_content(&self.parts)
    }

    /// Insert or replace a part by id. Returns true if the part is new.
    pub fn upsert_part(&mut self, part: Part) -> bool {
        if let Some(existing) = self.parts.iter_mut().find(|p| p.id == part.id) {
            *existing = part;
            false
        } else {
            self.parts.push(part);
            true
        }
    }
}

/// Total characters across the text parts of a slice.
#[must_use]
pub fn text_len(parts: &[Part]) -> usize {
    parts.iter().map(Part::text_len).sum()
}

/// Returns true if any part is a finish marker.
#[must_use]
pub fn has_finish_marker(parts: &[Part]) -> bool {
    parts.iter().any(Part::is_finish_marker)
}

/// Returns true if any text part has non-whitespace text, or any tool part exists.
#[must_use]
pub fn has_meaningful_content(parts: &[Part]) -> bool {
    parts.iter().any(|p| {
        p.is_tool() || (p.is_text() && p.text.as_deref().is_some_and(|t| !t.trim().is_empty()))
    })
}

/// A part waiting in the batched update queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingPart {
    /// Owning session.
    pub session_id: SessionId,
    /// Owning message.
    pub message_id: MessageId,
    /// The part itself.
    pub part: Part,
    /// Resolved author of the owning message.
    pub role: Role,
}

/// Session timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    /// Creation time.
    #[serde(default)]
    pub created: Timestamp,
    /// Last update time.
    #[serde(default)]
    pub updated: Timestamp,
    /// Last compaction time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<Timestamp>,
}

/// Session metadata as carried by `session.updated` and the session list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Display title, which agents may rename after finishing a turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Change summary (files, additions, deletions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    /// Working directory the session runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Parent session for forked sessions.
    #[serde(default, rename = "parentID", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    /// Timestamps.
    #[serde(default)]
    pub time: SessionTime,
}

impl SessionInfo {
    /// Create metadata with only an id.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            title: None,
            summary: None,
            directory: None,
            parent_id: None,
            time: SessionTime::default(),
        }
    }
}

/// A tool permission the agent is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    /// Permission identifier.
    pub id: PermissionId,
    /// Session the request belongs to.
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    /// Permission type (`edit`, `bash`, `webfetch`, ...).
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Human-readable prompt.
    #[serde(default)]
    pub title: String,
    /// Message that triggered the request.
    #[serde(default, rename = "messageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Tool-specific detail.
    #[serde(default)]
    pub metadata: Value,
}

/// What a session is doing, as reported by the server or a native bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityPhase {
    /// Generating.
    Busy,
    /// Waiting for input.
    Idle,
    /// Retrying after a provider error.
    Retry,
    /// Just finished; trailing events may still arrive.
    Cooldown,
}

impl ActivityPhase {
    /// Parse a phase string; unknown values are treated as `Idle`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "busy" | "working" => Self::Busy,
            "retry" => Self::Retry,
            "cooldown" => Self::Cooldown,
            _ => Self::Idle,
        }
    }
}
