//! Loading sessions from a remote source into a store.
//!
//! Message snapshots are only fetched here; the sync runtime applies them
//! itself so that live updates and reloads land in a single order.

use async_trait::async_trait;
use chamber_sync_core::{MessageRecord, SessionId, SessionInfo};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::SessionStore;

/// A remote source of full session data, usually the server's HTTP API.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Fetch every message of a session, with parts.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Source` if the request fails.
    async fn fetch_messages(&self, session_id: &SessionId) -> Result<Vec<MessageRecord>>;

    /// Fetch the session list.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Source` if the request fails.
    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>>;

    /// Fetch one session's metadata.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Source` if the request fails.
    async fn fetch_session(&self, session_id: &SessionId) -> Result<SessionInfo>;
}

/// Replace the session list with a fresh copy from `source`.
///
/// Returns the number of sessions loaded.
///
/// # Errors
///
/// Returns an error if the fetch or the store write fails.
#[instrument(skip(source, store))]
pub async fn load_sessions(source: &dyn SessionSource, store: &dyn SessionStore) -> Result<usize> {
    let sessions = source.fetch_sessions().await?;
    let count = sessions.len();
    store.replace_sessions(sessions)?;
    debug!(count, "loaded sessions");
    Ok(count)
}

/// Re-read one session's metadata and merge it into the store.
///
/// Returns true if title or summary changed.
///
/// # Errors
///
/// Returns an error if the fetch or the store write fails.
#[instrument(skip(source, store), fields(session_id = %session_id))]
pub async fn refresh_session(
    source: &dyn SessionSource,
    store: &dyn SessionStore,
    session_id: &SessionId,
) -> Result<bool> {
    let info = source.fetch_session(session_id).await?;
    store.apply_session_metadata(&info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::MemoryStore;

    struct FixedSource {
        fail: bool,
    }

    #[async_trait]
    impl SessionSource for FixedSource {
        async fn fetch_messages(&self, _session_id: &SessionId) -> Result<Vec<MessageRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>> {
            if self.fail {
                return Err(StoreError::Source("connection refused".to_string()));
            }
            let mut info = SessionInfo::new(SessionId::new("ses_1").unwrap());
            info.title = Some("Refactor parser".to_string());
            Ok(vec![info])
        }

        async fn fetch_session(&self, session_id: &SessionId) -> Result<SessionInfo> {
            let mut info = SessionInfo::new(session_id.clone());
            info.title = Some("Renamed".to_string());
            Ok(info)
        }
    }

    #[tokio::test]
    async fn sessions_load_and_refresh() {
        let store = MemoryStore::new();
        let source = FixedSource { fail: false };
        assert_eq!(load_sessions(&source, &store).await.unwrap(), 1);
        let session = SessionId::new("ses_1").unwrap();
        assert!(refresh_session(&source, &store, &session).await.unwrap());
        assert_eq!(store.session(&session).unwrap().title.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn failed_session_fetch_leaves_store_untouched() {
        let store = MemoryStore::new();
        let source = FixedSource { fail: true };
        assert!(load_sessions(&source, &store).await.is_err());
        assert!(store.session(&SessionId::new("ses_1").unwrap()).is_none());
    }
}
