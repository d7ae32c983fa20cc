//! Core types for chamber-sync.
//!
//! This crate provides the foundational types shared by the store, the sync
//! engine, and the command-line client:
//!
//! - **Identifiers**: Strongly-typed, server-assigned ids for sessions, messages, parts, and permissions
//! - **Message model**: Message headers, parts, sessions, and permission requests
//! - **Events**: The raw server-push event and its classified form
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use chamber_sync_core::{ServerEvent, StreamEvent};
//!
//! let raw = r#"{"type":"session.idle","properties":{"sessionID":"ses_1"}}"#;
//! let event = StreamEvent::from_json(raw).unwrap();
//! assert!(matches!(
//!     ServerEvent::classify(&event).unwrap(),
//!     ServerEvent::SessionStatus { .. }
//! ));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod event;
pub mod ids;
pub mod message;

pub use error::{CoreError, Result};
pub use event::{ServerEvent, StreamEvent};
pub use ids::{IdError, MessageId, PartId, PermissionId, SessionId};
pub use message::{
    now_ms, ActivityPhase, MessageInfo, MessageRecord, MessageTime, Part, Permission, Role,
    SessionInfo, SessionTime, StreamingPart, Timestamp,
};
