//! In-memory store implementation.
//!
//! Messages are kept per session in a `BTreeMap` keyed by message id, so
//! iteration order is creation order and the newest assistant message is a
//! reverse scan away. An optional window caps how many messages a session
//! keeps; the oldest are evicted first and reported back to the caller so the
//! engine can forget their streaming state.

use std::collections::{BTreeMap, HashMap};

use chamber_sync_core::{
    MessageId, MessageInfo, MessageRecord, Part, Permission, Role, SessionId, SessionInfo,
    Timestamp,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::types::{MessageParts, WriteOutcome};
use crate::{PermissionStore, ReadCursorSink, SessionStore};

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionInfo>,
    messages: HashMap<SessionId, BTreeMap<MessageId, MessageRecord>>,
    permissions: HashMap<SessionId, Vec<Permission>>,
}

/// A [`SessionStore`] and [`PermissionStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    window: Option<usize>,
    commits: Mutex<u64>,
}

impl MemoryStore {
    /// Create an empty store with no message window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that keeps at most `window` messages per session.
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            window: Some(window.max(1)),
            ..Self::default()
        }
    }

    /// Number of `commit_streaming_parts` calls applied so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        *self.commits.lock()
    }

    /// Number of messages held for a session.
    #[must_use]
    pub fn message_count(&self, session_id: &SessionId) -> usize {
        self.inner
            .read()
            .messages
            .get(session_id)
            .map_or(0, BTreeMap::len)
    }

    /// All known sessions, most recently updated first.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.inner.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated).then(a.id.cmp(&b.id)));
        sessions
    }

    fn evict(&self, messages: &mut BTreeMap<MessageId, MessageRecord>) -> Vec<MessageId> {
        let Some(window) = self.window else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while messages.len() > window {
            if let Some((id, _)) = messages.pop_first() {
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted messages outside window");
        }
        evicted
    }
}

fn upsert_part(
    messages: &mut BTreeMap<MessageId, MessageRecord>,
    part: Part,
    role: Role,
    outcome: &mut WriteOutcome,
) {
    let record = messages.entry(part.message_id.clone()).or_insert_with(|| {
        outcome.created.push(part.message_id.clone());
        MessageRecord::new(MessageInfo::new(
            part.message_id.clone(),
            part.session_id.clone(),
            role,
        ))
    });
    if record.upsert_part(part) {
        outcome.new_parts += 1;
    }
}

impl SessionStore for MemoryStore {
    fn messages(&self, session_id: &SessionId) -> Vec<MessageRecord> {
        self.inner
            .read()
            .messages
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn message(&self, session_id: &SessionId, message_id: &MessageId) -> Option<MessageRecord> {
        self.inner
            .read()
            .messages
            .get(session_id)
            .and_then(|m| m.get(message_id))
            .cloned()
    }

    fn session(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    fn latest_assistant_id(&self, session_id: &SessionId) -> Option<MessageId> {
        self.inner.read().messages.get(session_id).and_then(|m| {
            m.values()
                .rev()
                .find(|r| r.info.role == Role::Assistant)
                .map(|r| r.info.id.clone())
        })
    }

    fn update_message_info(&self, info: MessageInfo) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut inner = self.inner.write();
        let messages = inner.messages.entry(info.session_id.clone()).or_default();
        match messages.get_mut(&info.id) {
            Some(record) => {
                let completed = record.info.time.completed;
                record.info = info;
                if record.info.time.completed.is_none() {
                    record.info.time.completed = completed;
                }
            }
            None => {
                outcome.created.push(info.id.clone());
                messages.insert(info.id.clone(), MessageRecord::new(info));
            }
        }
        outcome.evicted = self.evict(messages);
        Ok(outcome)
    }

    fn add_streaming_part(&self, part: Part, role: Role) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut inner = self.inner.write();
        let messages = inner.messages.entry(part.session_id.clone()).or_default();
        upsert_part(messages, part, role, &mut outcome);
        outcome.evicted = self.evict(messages);
        Ok(outcome)
    }

    fn commit_streaming_parts(&self, batch: &[MessageParts]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        {
            let mut inner = self.inner.write();
            for group in batch {
                let messages = inner.messages.entry(group.session_id.clone()).or_default();
                for part in &group.parts {
                    upsert_part(messages, part.clone(), group.role, &mut outcome);
                }
                let evicted = self.evict(messages);
                outcome.evicted.extend(evicted);
            }
        }
        *self.commits.lock() += 1;
        Ok(outcome)
    }

    fn complete_streaming_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        completed_at: Timestamp,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(record) = inner
            .messages
            .get_mut(session_id)
            .and_then(|m| m.get_mut(message_id))
        else {
            return Ok(false);
        };
        record.info.time.completed.get_or_insert(completed_at);
        Ok(true)
    }

    fn remove_message(&self, session_id: &SessionId, message_id: &MessageId) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .messages
            .get_mut(session_id)
            .and_then(|m| m.remove(message_id))
            .is_some())
    }

    fn replace_messages(
        &self,
        session_id: &SessionId,
        messages: Vec<MessageRecord>,
    ) -> Result<Vec<MessageId>> {
        let mut fresh: BTreeMap<MessageId, MessageRecord> = messages
            .into_iter()
            .filter(|r| &r.info.session_id == session_id)
            .map(|r| (r.info.id.clone(), r))
            .collect();
        self.evict(&mut fresh);

        let mut inner = self.inner.write();
        let previous = inner
            .messages
            .insert(session_id.clone(), fresh)
            .unwrap_or_default();
        let current = &inner.messages[session_id];
        Ok(previous
            .into_keys()
            .filter(|id| !current.contains_key(id))
            .collect())
    }

    fn apply_session_metadata(&self, info: &SessionInfo) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(existing) = inner.sessions.get_mut(&info.id) else {
            inner.sessions.insert(info.id.clone(), info.clone());
            return Ok(true);
        };

        let mut changed = false;
        if info.title.is_some() && existing.title != info.title {
            existing.title.clone_from(&info.title);
            changed = true;
        }
        if info.summary.is_some() && existing.summary != info.summary {
            existing.summary.clone_from(&info.summary);
            changed = true;
        }
        if info.directory.is_some() {
            existing.directory.clone_from(&info.directory);
        }
        if info.parent_id.is_some() {
            existing.parent_id.clone_from(&info.parent_id);
        }
        existing.time.updated = existing.time.updated.max(info.time.updated);
        if existing.time.created == 0 {
            existing.time.created = info.time.created;
        }
        Ok(changed)
    }

    fn update_session_compaction(&self, session_id: &SessionId, at: Timestamp) -> Result<()> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        session.time.compacting = Some(at);
        Ok(())
    }

    fn replace_sessions(&self, sessions: Vec<SessionInfo>) -> Result<()> {
        self.inner.write().sessions = sessions.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(())
    }
}

impl PermissionStore for MemoryStore {
    fn add_permission(&self, permission: Permission) -> Result<()> {
        let mut inner = self.inner.write();
        let pending = inner
            .permissions
            .entry(permission.session_id.clone())
            .or_default();
        match pending.iter_mut().find(|p| p.id == permission.id) {
            Some(existing) => *existing = permission,
            None => pending.push(permission),
        }
        Ok(())
    }

    fn pending_permissions(&self, session_id: &SessionId) -> Vec<Permission> {
        self.inner
            .read()
            .permissions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Read cursors held in memory.
#[derive(Debug, Default)]
pub struct MemoryReadCursors {
    cursors: RwLock<HashMap<SessionId, (MessageId, Timestamp)>>,
}

impl MemoryReadCursors {
    /// Create an empty cursor table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last message marked read in a session.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<(MessageId, Timestamp)> {
        self.cursors.read().get(session_id).cloned()
    }
}

impl ReadCursorSink for MemoryReadCursors {
    fn mark_read(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        at: Timestamp,
    ) -> Result<()> {
        self.cursors
            .write()
            .insert(session_id.clone(), (message_id.clone(), at));
        Ok(())
    }
}
