//! Read cursors persisted to a JSON file.
//!
//! The file maps each session to the last message the user has seen:
//!
//! ```json
//! { "ses_1": { "messageID": "msg_9", "at": 1700000000000 } }
//! ```
//!
//! Every `mark_read` rewrites the file through a temporary sibling and a
//! rename, so a crash never leaves a half-written file behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chamber_sync_core::{MessageId, SessionId, Timestamp};
use chamber_sync_store::{ReadCursorSink, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorEntry {
    #[serde(rename = "messageID")]
    message_id: MessageId,
    at: Timestamp,
}

/// Read cursors backed by a JSON file.
#[derive(Debug)]
pub struct FileReadCursors {
    path: PathBuf,
    cursors: Mutex<BTreeMap<SessionId, CursorEntry>>,
}

impl FileReadCursors {
    /// Open the cursor file at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if the file exists but cannot be read or
    /// parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cursors = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                StoreError::Storage(format!("invalid cursor file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        debug!(path = %path.display(), sessions = cursors.len(), "opened read cursors");
        Ok(Self {
            path,
            cursors: Mutex::new(cursors),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last message marked read in a session.
    pub fn get(&self, session_id: &SessionId) -> Option<(MessageId, Timestamp)> {
        self.cursors
            .lock()
            .get(session_id)
            .map(|entry| (entry.message_id.clone(), entry.at))
    }

    fn persist(&self, cursors: &BTreeMap<SessionId, CursorEntry>) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(cursors)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                warn!(path = %self.path.display(), error = %e, "failed to write read cursors");
                StoreError::Storage(format!("failed to write {}: {e}", self.path.display()))
            })
    }
}

impl ReadCursorSink for FileReadCursors {
    fn mark_read(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut cursors = self.cursors.lock();
        let entry = CursorEntry {
            message_id: message_id.clone(),
            at,
        };
        if cursors.get(session_id) == Some(&entry) {
            return Ok(());
        }
        cursors.insert(session_id.clone(), entry);
        self.persist(&cursors)
    }
}
