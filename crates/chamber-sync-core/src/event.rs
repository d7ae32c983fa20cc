//! Server-push event schema.
//!
//! The transport delivers loosely typed `{ type, properties }` objects. The
//! engine classifies each one into a [`ServerEvent`] before acting on it; event
//! types it does not know about pass through as [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::ids::{MessageId, SessionId};
use crate::message::{ActivityPhase, MessageInfo, Part, Permission, Role, SessionInfo};

/// Raw event as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event type, e.g. `message.part.updated`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl StreamEvent {
    /// Build an event from a type and a JSON object payload.
    ///
    /// Non-object payloads are dropped.
    #[must_use]
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        let properties = match properties {
            Value::Object(map) => Some(map),
            _ => None,
        };
        Self {
            kind: kind.into(),
            properties,
        }
    }

    /// Parse an event from JSON text.
    ///
    /// Accepts both a bare event and the `{ directory, payload }` envelope the
    /// global event endpoint wraps events in.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Json` if the text is not a valid event.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(text)?;
        if let Some(payload) = value.get_mut("payload") {
            value = payload.take();
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Look up a property by key.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.as_ref().and_then(|p| p.get(key))
    }

    /// Best-effort session id of the event, wherever the schema puts it.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        let props = self.properties.as_ref()?;
        let candidates = [
            props.get("sessionID"),
            props.get("info").and_then(|i| i.get("sessionID")),
            props.get("part").and_then(|p| p.get("sessionID")),
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(Value::as_str)
            .and_then(|s| SessionId::new(s).ok())
            .or_else(|| {
                if self.kind.starts_with("session.") {
                    props
                        .get("info")
                        .and_then(|i| i.get("id"))
                        .and_then(Value::as_str)
                        .and_then(|s| SessionId::new(s).ok())
                } else {
                    None
                }
            })
    }
}

/// A classified server event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A part of a message was created or grew.
    MessagePartUpdated {
        /// The full part snapshot.
        part: Part,
        /// Role reported by the event itself, if any.
        role: Option<Role>,
        /// Incremental text, if the server sent one.
        delta: Option<String>,
    },
    /// A message header changed, optionally with a full part snapshot.
    MessageUpdated {
        /// Message header.
        info: MessageInfo,
        /// Part snapshot, when included.
        parts: Option<Vec<Part>>,
    },
    /// The server dropped a message.
    MessageRemoved {
        /// Owning session.
        session_id: SessionId,
        /// Removed message.
        message_id: MessageId,
    },
    /// Session metadata changed.
    SessionUpdated {
        /// New metadata.
        info: SessionInfo,
    },
    /// The session history was compacted.
    SessionCompacted {
        /// Compacted session.
        session_id: SessionId,
    },
    /// The session's activity phase changed.
    SessionStatus {
        /// Session.
        session_id: SessionId,
        /// New phase.
        phase: ActivityPhase,
    },
    /// Generation was aborted by the user.
    SessionAborted {
        /// Session.
        session_id: SessionId,
    },
    /// Generation failed.
    SessionError {
        /// Session, when the server attributes the error to one.
        session_id: Option<SessionId>,
        /// Error payload.
        error: Option<Value>,
    },
    /// A permission request was raised or updated.
    PermissionUpdated {
        /// The request.
        permission: Permission,
    },
    /// The server acknowledged the subscription.
    ServerConnected,
    /// Keep-alive.
    Heartbeat,
    /// Any other event type.
    Unknown {
        /// The unrecognised event type.
        kind: String,
    },
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: Part,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    info: Option<RoleOnly>,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct RoleOnly {
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfo,
    #[serde(default)]
    parts: Option<Vec<Part>>,
}

#[derive(Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: SessionId,
    #[serde(rename = "messageID")]
    message_id: MessageId,
}

#[derive(Deserialize)]
struct SessionInfoProps {
    info: SessionInfo,
}

#[derive(Deserialize)]
struct SessionOnlyProps {
    #[serde(rename = "sessionID")]
    session_id: SessionId,
}

#[derive(Deserialize)]
struct SessionStatusProps {
    #[serde(rename = "sessionID")]
    session_id: SessionId,
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    phase: Option<String>,
}

#[derive(Deserialize)]
struct SessionErrorProps {
    #[serde(default, rename = "sessionID")]
    session_id: Option<SessionId>,
    #[serde(default)]
    error: Option<Value>,
}

impl ServerEvent {
    /// Classify a raw event.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MalformedEvent` when a known event type carries a
    /// payload that does not match its schema.
    pub fn classify(event: &StreamEvent) -> Result<Self> {
        let props = || Value::Object(event.properties.clone().unwrap_or_default());
        let malformed = |err: serde_json::Error| CoreError::MalformedEvent {
            kind: event.kind.clone(),
            reason: err.to_string(),
        };

        let classified = match event.kind.as_str() {
            "message.part.updated" => {
                let p: PartUpdatedProps = serde_json::from_value(props()).map_err(malformed)?;
                let role = p.role.or_else(|| p.info.and_then(|i| i.role));
                Self::MessagePartUpdated {
                    part: p.part,
                    role,
                    delta: p.delta,
                }
            }
            "message.updated" => {
                let p: MessageUpdatedProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::MessageUpdated {
                    info: p.info,
                    parts: p.parts,
                }
            }
            "message.removed" => {
                let p: MessageRemovedProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::MessageRemoved {
                    session_id: p.session_id,
                    message_id: p.message_id,
                }
            }
            "session.updated" | "session.created" => {
                let p: SessionInfoProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::SessionUpdated { info: p.info }
            }
            "session.compacted" => {
                let p: SessionOnlyProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::SessionCompacted {
                    session_id: p.session_id,
                }
            }
            "session.status" => {
                let p: SessionStatusProps = serde_json::from_value(props()).map_err(malformed)?;
                let phase = p
                    .phase
                    .or_else(|| {
                        p.status.as_ref().and_then(|s| {
                            s.as_str()
                                .map(str::to_string)
                                .or_else(|| s.get("type").and_then(Value::as_str).map(str::to_string))
                        })
                    })
                    .map_or(ActivityPhase::Idle, |s| ActivityPhase::parse(&s));
                Self::SessionStatus {
                    session_id: p.session_id,
                    phase,
                }
            }
            "session.idle" => {
                let p: SessionOnlyProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::SessionStatus {
                    session_id: p.session_id,
                    phase: ActivityPhase::Idle,
                }
            }
            "session.aborted" => {
                let p: SessionOnlyProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::SessionAborted {
                    session_id: p.session_id,
                }
            }
            "session.error" => {
                let p: SessionErrorProps = serde_json::from_value(props()).map_err(malformed)?;
                Self::SessionError {
                    session_id: p.session_id,
                    error: p.error,
                }
            }
            "permission.updated" | "permission.asked" => {
                let permission: Permission = serde_json::from_value(props()).map_err(malformed)?;
                Self::PermissionUpdated { permission }
            }
            "server.connected" => Self::ServerConnected,
            "server.heartbeat" => Self::Heartbeat,
            other => Self::Unknown {
                kind: other.to_string(),
            },
        };

        Ok(classified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_global_envelope() {
        let text = r#"{"directory":"/repo","payload":{"type":"server.heartbeat","properties":{}}}"#;
        let event = StreamEvent::from_json(text).unwrap();
        assert_eq!(event.kind, "server.heartbeat");
        assert_eq!(ServerEvent::classify(&event).unwrap(), ServerEvent::Heartbeat);
    }

    #[test]
    fn classifies_part_update_with_info_role() {
        let event = StreamEvent::new(
            "message.part.updated",
            json!({
                "part": {
                    "id": "prt_1", "sessionID": "ses_1", "messageID": "msg_1",
                    "type": "text", "text": "hi",
                },
                "info": {"role": "user"},
                "delta": "hi",
            }),
        );
        match ServerEvent::classify(&event).unwrap() {
            ServerEvent::MessagePartUpdated { part, role, delta } => {
                assert_eq!(part.message_id.as_str(), "msg_1");
                assert_eq!(role, Some(Role::User));
                assert_eq!(delta.as_deref(), Some("hi"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(event.session_id().unwrap().as_str(), "ses_1");
    }

    #[test]
    fn classifies_session_status_object() {
        let event = StreamEvent::new(
            "session.status",
            json!({"sessionID": "ses_1", "status": {"type": "busy"}}),
        );
        assert_eq!(
            ServerEvent::classify(&event).unwrap(),
            ServerEvent::SessionStatus {
                session_id: SessionId::new("ses_1").unwrap(),
                phase: ActivityPhase::Busy,
            }
        );
    }

    #[test]
    fn session_updated_exposes_session_id() {
        let event = StreamEvent::new(
            "session.updated",
            json!({"info": {"id": "ses_9", "title": "Fix bug"}}),
        );
        assert_eq!(event.session_id().unwrap().as_str(), "ses_9");
        match ServerEvent::classify(&event).unwrap() {
            ServerEvent::SessionUpdated { info } => assert_eq!(info.title.as_deref(), Some("Fix bug")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_known_event_is_an_error() {
        let event = StreamEvent::new("message.updated", json!({"info": {"id": ""}}));
        let err = ServerEvent::classify(&event).unwrap_err();
        assert!(matches!(err, CoreError::MalformedEvent { ref kind, .. } if kind == "message.updated"));
    }

    #[test]
    fn unknown_events_pass_through() {
        let event = StreamEvent::new("lsp.updated", json!({}));
        assert_eq!(
            ServerEvent::classify(&event).unwrap(),
            ServerEvent::Unknown {
                kind: "lsp.updated".to_string()
            }
        );
    }
}
