//! Event interpretation.
//!
//! [`EventInterpreter`] turns classified server events into store writes,
//! lifecycle updates, and [`ViewNotification`]s. Message content is only
//! applied for the active session; session metadata is applied for any
//! session.
//!
//! Two guards protect the transcript from out-of-order delivery:
//!
//! - **Shrink guard**: an assistant snapshot noticeably shorter than what is
//!   stored is dropped unless it carries a finish marker. Native transports
//!   allow no shrink at all unless the finish marker comes with real content.
//! - **Completion ordering**: a completion only counts for the newest
//!   assistant message of the session. Native transports without a finish
//!   marker defer completion until a follow-up event, an explicit bridge
//!   signal, or the optional fallback timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chamber_sync_core::message::{has_finish_marker, has_meaningful_content, text_len};
use chamber_sync_core::{
    now_ms, ActivityPhase, MessageId, MessageInfo, Part, Permission, PermissionId, Role,
    ServerEvent, SessionId, SessionInfo, StreamEvent, StreamingPart,
};
use chamber_sync_store::{MessageParts, PermissionStore, ReadCursorSink, SessionStore};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::autoscroll::ContentMutation;
use crate::bounded::BoundedIdSet;
use crate::config::EngineConfig;
use crate::queue::BatchedUpdateQueue;
use crate::scheduler::{TimerKind, Timers};
use crate::tracker::LifecycleTracker;
use crate::transport::TransportKind;

/// Something a view of the active session may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewNotification {
    /// Streaming text of a message grew.
    TextGrew {
        /// Session.
        session_id: SessionId,
        /// Message.
        message_id: MessageId,
    },
    /// A message or a non-text part appeared.
    BlockAdded {
        /// Session.
        session_id: SessionId,
        /// Message.
        message_id: MessageId,
    },
    /// A permission prompt is waiting.
    PermissionPrompt {
        /// Session.
        session_id: SessionId,
        /// Permission.
        permission_id: PermissionId,
    },
    /// A message finished.
    MessageCompleted {
        /// Session.
        session_id: SessionId,
        /// Message.
        message_id: MessageId,
    },
    /// A finished assistant message had nothing to show.
    EmptyResponse {
        /// Session.
        session_id: SessionId,
        /// Message.
        message_id: MessageId,
    },
    /// The session's messages were reloaded from the server.
    SessionReloaded {
        /// Session.
        session_id: SessionId,
    },
}

impl ViewNotification {
    /// The content mutation this notification represents, if any.
    #[must_use]
    pub const fn content_mutation(&self) -> Option<ContentMutation> {
        match self {
            Self::TextGrew { .. } => Some(ContentMutation::TextGrew),
            Self::BlockAdded { .. } | Self::SessionReloaded { .. } => {
                Some(ContentMutation::BlockAdded)
            }
            Self::PermissionPrompt { .. } => Some(ContentMutation::PermissionPrompt),
            Self::MessageCompleted { .. } | Self::EmptyResponse { .. } => None,
        }
    }
}

/// The external stores the interpreter writes to.
#[derive(Clone)]
pub struct Collaborators {
    /// Transcript store.
    pub store: Arc<dyn SessionStore>,
    /// Permission prompts.
    pub permissions: Arc<dyn PermissionStore>,
    /// Read cursors.
    pub cursors: Arc<dyn ReadCursorSink>,
}

#[derive(Debug, Clone)]
struct Deferred {
    session_id: SessionId,
    deadline: Option<Instant>,
}

/// Applies server events to the stores.
pub struct EventInterpreter {
    store: Arc<dyn SessionStore>,
    permissions: Arc<dyn PermissionStore>,
    cursors: Arc<dyn ReadCursorSink>,
    kind: TransportKind,
    active: Option<SessionId>,
    tracker: LifecycleTracker,
    queue: BatchedUpdateQueue,
    completed: BoundedIdSet<MessageId>,
    deferred: HashMap<MessageId, Deferred>,
    shrink_tolerance: usize,
    detect_empty_responses: bool,
    native_fallback: Option<Duration>,
    refresh_debounce: Duration,
    refresh_due: Option<SessionId>,
    reload_requested: Option<SessionId>,
    notifications: broadcast::Sender<ViewNotification>,
}

impl EventInterpreter {
    /// Create an interpreter with no active session.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        collaborators: Collaborators,
        kind: TransportKind,
        notifications: broadcast::Sender<ViewNotification>,
    ) -> Self {
        Self {
            store: collaborators.store,
            permissions: collaborators.permissions,
            cursors: collaborators.cursors,
            kind,
            active: None,
            tracker: LifecycleTracker::new(),
            queue: BatchedUpdateQueue::new(config.frame_interval()),
            completed: BoundedIdSet::new(config.completed_ids_capacity, config.completed_ids_evict),
            deferred: HashMap::new(),
            shrink_tolerance: config.shrink_tolerance,
            detect_empty_responses: config.detect_empty_responses,
            native_fallback: config.native_completion_fallback(),
            refresh_debounce: config.refresh_debounce(),
            refresh_due: None,
            reload_requested: None,
            notifications,
        }
    }

    /// The session whose content is being applied.
    #[must_use]
    pub fn active_session(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    /// Streaming lifecycle of the active session.
    #[must_use]
    pub const fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    /// The frame queue.
    #[must_use]
    pub const fn queue(&self) -> &BatchedUpdateQueue {
        &self.queue
    }

    /// Returns true if a completion for `message_id` is waiting on a follow-up.
    #[must_use]
    pub fn is_deferred(&self, message_id: &MessageId) -> bool {
        self.deferred.contains_key(message_id)
    }

    /// Returns true if `message_id` was completed.
    #[must_use]
    pub fn is_completed(&self, message_id: &MessageId) -> bool {
        self.completed.contains(message_id)
    }

    /// Switch the active session, dropping all streaming state of the old
    /// one. Returns false if nothing changed.
    pub fn set_active_session(&mut self, session_id: Option<SessionId>, timers: &mut Timers) -> bool {
        if self.active == session_id {
            return false;
        }
        self.queue.cancel_pending(timers);
        self.tracker.clear();
        self.deferred.clear();
        timers.cancel(TimerKind::NativeCompletion);
        debug!(session_id = ?session_id, "active session changed");
        self.reload_requested.clone_from(&session_id);
        self.active = session_id;
        true
    }

    /// Discard buffered parts without committing.
    pub fn cancel_pending(&mut self, timers: &mut Timers) {
        self.queue.cancel_pending(timers);
    }

    /// Session whose list and metadata should be refreshed now, if any.
    pub fn take_refresh(&mut self) -> Option<SessionId> {
        self.refresh_due.take()
    }

    /// Session whose messages should be reloaded, if any.
    pub fn take_reload(&mut self) -> Option<SessionId> {
        self.reload_requested.take()
    }

    /// Ask for a reload of the active session.
    pub fn request_reload(&mut self) {
        self.reload_requested.clone_from(&self.active);
    }

    fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.as_ref() == Some(session_id)
    }

    fn notify(&self, notification: ViewNotification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    fn forget(&mut self, ids: &[MessageId]) {
        if ids.is_empty() {
            return;
        }
        self.tracker.remove(ids);
        for id in ids {
            self.deferred.remove(id);
        }
    }

    /// Apply one raw event.
    pub fn handle_event(&mut self, event: &StreamEvent, now: Instant, timers: &mut Timers) {
        let classified = match ServerEvent::classify(event) {
            Ok(classified) => classified,
            Err(err) => {
                warn!(%err, "dropping malformed event");
                return;
            }
        };

        match classified {
            ServerEvent::MessagePartUpdated { part, role, delta } => {
                self.on_part_updated(part, role, delta, now, timers);
            }
            ServerEvent::MessageUpdated { info, parts } => {
                self.on_message_updated(info, parts, now, timers);
            }
            ServerEvent::MessageRemoved {
                session_id,
                message_id,
            } => self.on_message_removed(&session_id, &message_id, timers),
            ServerEvent::SessionUpdated { info } => self.on_session_updated(&info),
            ServerEvent::SessionCompacted { session_id } => self.on_session_compacted(&session_id),
            ServerEvent::SessionStatus { session_id, phase } => {
                self.on_session_activity(&session_id, phase);
            }
            ServerEvent::SessionAborted { session_id } => {
                self.force_complete_session(&session_id, "aborted", now, timers);
            }
            ServerEvent::SessionError { session_id, error } => {
                if let Some(session_id) = session_id {
                    debug!(session_id = %session_id, error = ?error, "session error");
                    self.force_complete_session(&session_id, "error", now, timers);
                }
            }
            ServerEvent::PermissionUpdated { permission } => self.on_permission(permission),
            ServerEvent::ServerConnected | ServerEvent::Heartbeat => {}
            ServerEvent::Unknown { kind } => trace!(kind, "ignoring event"),
        }
    }

    fn on_part_updated(
        &mut self,
        mut part: Part,
        role: Option<Role>,
        delta: Option<String>,
        now: Instant,
        timers: &mut Timers,
    ) {
        if !self.is_active(&part.session_id) {
            trace!(session_id = %part.session_id, "ignoring part for inactive session");
            return;
        }
        if let Some(delta) = delta {
            self.apply_delta(&mut part, &delta);
        }
        let role = role
            .or_else(|| {
                self.store
                    .message(&part.session_id, &part.message_id)
                    .map(|r| r.info.role)
            })
            .unwrap_or(Role::Assistant);
        if role == Role::User && part.synthetic {
            debug!(part_id = %part.id, "dropping synthetic part on user message");
            return;
        }
        self.queue.enqueue(
            StreamingPart {
                session_id: part.session_id.clone(),
                message_id: part.message_id.clone(),
                part,
                role,
            },
            now,
            timers,
        );
    }

    /// A text part sent as a bare delta gets its text rebuilt from the newest
    /// copy we hold, buffered or committed. Full snapshots win over deltas.
    fn apply_delta(&self, part: &mut Part, delta: &str) {
        if !part.is_text() || part.text.is_some() {
            return;
        }
        let base = match self.queue.buffered_text(&part.message_id, &part.id) {
            Some(text) => text.to_string(),
            None => self
                .store
                .message(&part.session_id, &part.message_id)
                .and_then(|record| record.parts.into_iter().find(|p| p.id == part.id))
                .and_then(|p| p.text)
                .unwrap_or_default(),
        };
        trace!(
            part_id = %part.id,
            base = base.len(),
            delta = delta.len(),
            "rebuilding part text from delta"
        );
        part.text = Some(base + delta);
    }

    /// The frame timer fired: commit everything buffered as one store write.
    ///
    /// Returns the number of parts committed.
    pub fn flush(&mut self, now: Instant, timers: &mut Timers) -> usize {
        let Some(batch) = self.queue.flush(timers) else {
            return 0;
        };
        let outcome = match self.store.commit_streaming_parts(batch.groups()) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "dropping frame after failed commit");
                return 0;
            }
        };

        let ts = now_ms();
        let streaming: Vec<&MessageId> = batch
            .groups()
            .iter()
            .filter(|g| g.role == Role::Assistant && !self.completed.contains(&g.message_id))
            .map(|g| &g.message_id)
            .collect();
        self.tracker.touch_batch(streaming, ts);
        self.forget(&outcome.evicted);

        for group in batch.groups() {
            let structural = outcome.created.contains(&group.message_id)
                || group.parts.iter().any(|p| !p.is_text());
            let session_id = group.session_id.clone();
            let message_id = group.message_id.clone();
            self.notify(if structural {
                ViewNotification::BlockAdded {
                    session_id,
                    message_id,
                }
            } else {
                ViewNotification::TextGrew {
                    session_id,
                    message_id,
                }
            });
        }

        let resolved: Vec<(SessionId, MessageId)> = batch
            .groups()
            .iter()
            .filter(|g| self.deferred.contains_key(&g.message_id))
            .map(|g| (g.session_id.clone(), g.message_id.clone()))
            .collect();
        for (session_id, message_id) in resolved {
            debug!(message_id = %message_id, "follow-up parts resolved deferred completion");
            self.complete(&session_id, &message_id, now, timers);
        }

        batch.part_count()
    }

    fn on_message_updated(
        &mut self,
        info: MessageInfo,
        parts: Option<Vec<Part>>,
        now: Instant,
        timers: &mut Timers,
    ) {
        if !self.is_active(&info.session_id) {
            trace!(session_id = %info.session_id, "ignoring message for inactive session");
            return;
        }
        match info.role {
            Role::User => self.apply_user_message(info, parts),
            Role::Assistant => self.apply_assistant_message(info, parts, now, timers),
        }
    }

    fn apply_user_message(&mut self, info: MessageInfo, parts: Option<Vec<Part>>) {
        let session_id = info.session_id.clone();
        let message_id = info.id.clone();
        let mut outcome = match self.store.update_message_info(info) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, message_id = %message_id, "failed to store user message");
                return;
            }
        };
        if let Some(parts) = parts {
            self.queue.supersede(&message_id, Some(&parts));
            for part in parts.into_iter().filter(|p| !p.synthetic) {
                match self.store.add_streaming_part(part, Role::User) {
                    Ok(o) => outcome.merge(o),
                    Err(err) => warn!(%err, message_id = %message_id, "failed to store user part"),
                }
            }
        }
        self.forget(&outcome.evicted);
        if outcome.created.contains(&message_id) {
            self.notify(ViewNotification::BlockAdded {
                session_id,
                message_id,
            });
        }
    }

    fn rejects_shrink(&self, stored: usize, incoming: usize, finished: bool, parts: &[Part]) -> bool {
        match self.kind {
            TransportKind::Web => incoming + self.shrink_tolerance < stored && !finished,
            TransportKind::Native => {
                incoming < stored && !(finished && has_meaningful_content(parts))
            }
        }
    }

    fn apply_assistant_message(
        &mut self,
        info: MessageInfo,
        parts: Option<Vec<Part>>,
        now: Instant,
        timers: &mut Timers,
    ) {
        let session_id = info.session_id.clone();
        let message_id = info.id.clone();
        let finished = parts.as_deref().is_some_and(has_finish_marker)
            || info.finish.as_deref() == Some("stop");

        if let Some(parts) = &parts {
            let stored = self
                .store
                .message(&session_id, &message_id)
                .map_or(0, |r| r.text_len());
            let incoming = text_len(parts);
            if self.rejects_shrink(stored, incoming, finished, parts) {
                debug!(
                    message_id = %message_id,
                    stored,
                    incoming,
                    "discarding regressive snapshot"
                );
                return;
            }
        }

        let was_deferred = self.deferred.contains_key(&message_id);
        let failed = info.error.is_some()
            || matches!(info.status.as_deref(), Some("error" | "aborted"));
        let signals_completion = info.signals_completion();

        let mut outcome = match self.store.update_message_info(info) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, message_id = %message_id, "failed to store assistant message");
                return;
            }
        };
        let had_parts = parts.is_some();
        if let Some(parts) = parts {
            self.queue.supersede(&message_id, Some(&parts));
            let mut group = MessageParts::new(session_id.clone(), message_id.clone(), Role::Assistant);
            group.parts = parts;
            match self.store.commit_streaming_parts(std::slice::from_ref(&group)) {
                Ok(o) => outcome.merge(o),
                Err(err) => warn!(%err, message_id = %message_id, "failed to store snapshot parts"),
            }
            if !self.completed.contains(&message_id) {
                self.tracker.touch_batch([&message_id], now_ms());
            }
        }
        self.forget(&outcome.evicted);

        if outcome.created.contains(&message_id) {
            self.notify(ViewNotification::BlockAdded {
                session_id: session_id.clone(),
                message_id: message_id.clone(),
            });
        } else if had_parts {
            self.notify(ViewNotification::TextGrew {
                session_id: session_id.clone(),
                message_id: message_id.clone(),
            });
        }

        if failed {
            debug!(message_id = %message_id, "message failed; forcing completion");
            self.complete(&session_id, &message_id, now, timers);
        } else if was_deferred {
            debug!(message_id = %message_id, "follow-up event resolved deferred completion");
            self.complete(&session_id, &message_id, now, timers);
        } else if signals_completion {
            self.try_complete(&session_id, &message_id, finished, now, timers);
        }
    }

    fn try_complete(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        finished: bool,
        now: Instant,
        timers: &mut Timers,
    ) {
        if self.completed.contains(message_id) {
            trace!(message_id = %message_id, "duplicate completion");
            return;
        }
        let latest = self.store.latest_assistant_id(session_id);
        if latest.as_ref() != Some(message_id) {
            debug!(
                message_id = %message_id,
                latest = ?latest,
                "ignoring completion of a message that is not the latest"
            );
            return;
        }
        if self.kind == TransportKind::Native && !finished {
            debug!(message_id = %message_id, "deferring native completion until a follow-up");
            self.deferred.insert(
                message_id.clone(),
                Deferred {
                    session_id: session_id.clone(),
                    deadline: self.native_fallback.map(|d| now + d),
                },
            );
            self.arm_fallback(timers);
            return;
        }
        self.complete(session_id, message_id, now, timers);
    }

    fn arm_fallback(&self, timers: &mut Timers) {
        match self.deferred.values().filter_map(|d| d.deadline).min() {
            Some(at) => timers.arm(TimerKind::NativeCompletion, at),
            None => {
                timers.cancel(TimerKind::NativeCompletion);
            }
        }
    }

    fn complete(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        now: Instant,
        timers: &mut Timers,
    ) -> bool {
        if !self.completed.insert(message_id.clone()) {
            return false;
        }
        if self.deferred.remove(message_id).is_some() {
            self.arm_fallback(timers);
        }

        let ts = now_ms();
        if let Err(err) = self.store.complete_streaming_message(session_id, message_id, ts) {
            warn!(%err, message_id = %message_id, "failed to stamp completion");
        }
        self.tracker.mark_completed(message_id, ts);
        if let Err(err) = self.cursors.mark_read(session_id, message_id, ts) {
            warn!(%err, session_id = %session_id, "failed to persist read cursor");
        }
        self.refresh_due = Some(session_id.clone());
        timers.arm_in(TimerKind::SessionRefresh, now, self.refresh_debounce);

        info!(session_id = %session_id, message_id = %message_id, "message completed");
        self.notify(ViewNotification::MessageCompleted {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        });

        if self.detect_empty_responses && !self.queue.has_message(message_id) {
            let empty = self
                .store
                .message(session_id, message_id)
                .is_none_or(|r| r.info.role == Role::Assistant && !r.has_meaningful_content());
            if empty {
                debug!(message_id = %message_id, "assistant finished without content");
                self.notify(ViewNotification::EmptyResponse {
                    session_id: session_id.clone(),
                    message_id: message_id.clone(),
                });
            }
        }
        true
    }

    fn force_complete_session(
        &mut self,
        session_id: &SessionId,
        reason: &str,
        now: Instant,
        timers: &mut Timers,
    ) {
        if !self.is_active(session_id) {
            return;
        }
        let mut ids = self.tracker.active_ids();
        ids.extend(self.deferred.keys().cloned());
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return;
        }
        info!(session_id = %session_id, reason, count = ids.len(), "force-completing messages");
        for id in ids {
            self.complete(session_id, &id, now, timers);
        }
    }

    fn on_message_removed(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        timers: &mut Timers,
    ) {
        if !self.is_active(session_id) {
            return;
        }
        self.queue.supersede(message_id, None);
        if let Err(err) = self.store.remove_message(session_id, message_id) {
            warn!(%err, message_id = %message_id, "failed to remove message");
        }
        self.forget(std::slice::from_ref(message_id));
        self.arm_fallback(timers);
    }

    fn on_session_updated(&mut self, info: &SessionInfo) {
        match self.store.apply_session_metadata(info) {
            Ok(true) => debug!(session_id = %info.id, title = ?info.title, "session metadata changed"),
            Ok(false) => {}
            Err(err) => warn!(%err, session_id = %info.id, "failed to apply session metadata"),
        }
    }

    fn on_session_compacted(&mut self, session_id: &SessionId) {
        if let Err(err) = self.store.update_session_compaction(session_id, now_ms()) {
            debug!(%err, session_id = %session_id, "compaction for unknown session");
        }
        if self.is_active(session_id) {
            self.reload_requested = Some(session_id.clone());
        }
    }

    /// A session changed activity phase, from the server or a bridge.
    pub fn on_session_activity(&mut self, session_id: &SessionId, phase: ActivityPhase) {
        if !self.is_active(session_id) {
            return;
        }
        trace!(session_id = %session_id, ?phase, "session activity");
        if matches!(phase, ActivityPhase::Cooldown | ActivityPhase::Idle) {
            let ts = now_ms();
            for id in self.tracker.active_ids() {
                self.tracker.mark_cooldown(&id, ts);
            }
        }
    }

    /// A native bridge reported that a message finished.
    pub fn on_message_complete(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        now: Instant,
        timers: &mut Timers,
    ) {
        if !self.is_active(session_id) {
            return;
        }
        if self.deferred.contains_key(message_id) {
            self.complete(session_id, message_id, now, timers);
            return;
        }
        self.try_complete(session_id, message_id, true, now, timers);
    }

    /// The fallback timer fired: complete every deferred message whose
    /// deadline passed.
    pub fn on_native_fallback(&mut self, now: Instant, timers: &mut Timers) {
        let due: Vec<(SessionId, MessageId)> = self
            .deferred
            .iter()
            .filter(|(_, d)| d.deadline.is_some_and(|at| at <= now))
            .map(|(id, d)| (d.session_id.clone(), id.clone()))
            .collect();
        for (session_id, message_id) in due {
            debug!(message_id = %message_id, "completing deferred message after fallback");
            self.complete(&session_id, &message_id, now, timers);
        }
        self.arm_fallback(timers);
    }

    fn on_permission(&mut self, permission: Permission) {
        if !self.is_active(&permission.session_id) {
            trace!(session_id = %permission.session_id, "ignoring permission for inactive session");
            return;
        }
        let session_id = permission.session_id.clone();
        let permission_id = permission.id.clone();
        if let Err(err) = self.permissions.add_permission(permission) {
            warn!(%err, permission_id = %permission_id, "failed to store permission");
            return;
        }
        self.notify(ViewNotification::PermissionPrompt {
            session_id,
            permission_id,
        });
    }

    /// A reload of `session_id` finished; `dropped` are the ids the store no
    /// longer holds.
    pub fn on_reloaded(&mut self, session_id: &SessionId, dropped: &[MessageId]) {
        if !self.is_active(session_id) {
            return;
        }
        self.forget(dropped);
        self.notify(ViewNotification::SessionReloaded {
            session_id: session_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chamber_sync_store::{MemoryReadCursors, MemoryStore};
    use serde_json::{json, Value};

    struct Harness {
        interpreter: EventInterpreter,
        store: Arc<MemoryStore>,
        cursors: Arc<MemoryReadCursors>,
        rx: broadcast::Receiver<ViewNotification>,
        timers: Timers,
        now: Instant,
    }

    impl Harness {
        fn new(kind: TransportKind) -> Self {
            Self::with_config(kind, EngineConfig::default())
        }

        fn with_config(kind: TransportKind, config: EngineConfig) -> Self {
            Self::with_store(kind, config, Arc::new(MemoryStore::new()))
        }

        fn with_store(kind: TransportKind, config: EngineConfig, store: Arc<MemoryStore>) -> Self {
            let cursors = Arc::new(MemoryReadCursors::new());
            let (tx, rx) = broadcast::channel(256);
            let collaborators = Collaborators {
                store: store.clone(),
                permissions: store.clone(),
                cursors: cursors.clone(),
            };
            let mut interpreter = EventInterpreter::new(&config, collaborators, kind, tx);
            let mut timers = Timers::new();
            interpreter.set_active_session(Some(sid("ses_1")), &mut timers);
            interpreter.take_reload();
            Self {
                interpreter,
                store,
                cursors,
                rx,
                timers,
                now: Instant::now(),
            }
        }

        fn send(&mut self, kind: &str, properties: Value) {
            let event = StreamEvent::new(kind, properties);
            self.interpreter
                .handle_event(&event, self.now, &mut self.timers);
        }

        fn flush(&mut self) -> usize {
            self.interpreter.flush(self.now, &mut self.timers)
        }

        fn drain(&mut self) -> Vec<ViewNotification> {
            let mut out = Vec::new();
            while let Ok(n) = self.rx.try_recv() {
                out.push(n);
            }
            out
        }

        fn text_len(&self, message: &str) -> usize {
            self.store
                .message(&sid("ses_1"), &mid(message))
                .map_or(0, |r| r.text_len())
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn mid(s: &str) -> MessageId {
        MessageId::new(s).unwrap()
    }

    fn text_part(session: &str, message: &str, part: &str, text: &str) -> Value {
        json!({
            "id": part, "sessionID": session, "messageID": message,
            "type": "text", "text": text,
        })
    }

    fn finish_part(message: &str) -> Value {
        json!({
            "id": format!("{message}_finish"), "sessionID": "ses_1", "messageID": message,
            "type": "step-finish", "reason": "stop",
        })
    }

    fn assistant_info(message: &str, completed: Option<u64>) -> Value {
        let mut time = json!({"created": 1});
        if let Some(at) = completed {
            time["completed"] = json!(at);
        }
        json!({"id": message, "sessionID": "ses_1", "role": "assistant", "time": time})
    }

    fn seed_assistant(h: &mut Harness, message: &str, len: usize) {
        h.send(
            "message.updated",
            json!({
                "info": assistant_info(message, None),
                "parts": [text_part("ses_1", message, "prt_1", &"a".repeat(len))],
            }),
        );
    }

    #[test]
    fn part_updates_flush_once_per_frame() {
        let mut h = Harness::new(TransportKind::Web);
        for i in 0..10 {
            h.send(
                "message.part.updated",
                json!({"part": text_part("ses_1", "msg_1", "prt_1", &"x".repeat(i + 1))}),
            );
        }
        assert!(h.timers.is_armed(TimerKind::Frame));
        assert_eq!(h.flush(), 10);
        assert_eq!(h.store.commit_count(), 1);
        assert_eq!(h.text_len("msg_1"), 10);
        assert!(h.interpreter.tracker().get(&mid("msg_1")).is_some());
        assert_eq!(
            h.drain(),
            vec![ViewNotification::BlockAdded {
                session_id: sid("ses_1"),
                message_id: mid("msg_1"),
            }]
        );

        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_1", "more text")}),
        );
        h.flush();
        assert!(matches!(h.drain()[..], [ViewNotification::TextGrew { .. }]));
    }

    #[test]
    fn bare_deltas_extend_the_newest_text() {
        let mut h = Harness::new(TransportKind::Web);
        let bare = json!({
            "id": "prt_1", "sessionID": "ses_1", "messageID": "msg_1", "type": "text",
        });
        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_1", "Hel")}),
        );
        h.flush();

        // First delta builds on the committed text, the second on the buffered one.
        h.send("message.part.updated", json!({"part": bare, "delta": "lo"}));
        h.send("message.part.updated", json!({"part": bare, "delta": " world"}));
        h.flush();
        assert_eq!(h.text_len("msg_1"), 11);

        // A full snapshot is taken as is.
        h.send(
            "message.part.updated",
            json!({
                "part": text_part("ses_1", "msg_1", "prt_1", "Hello world!"),
                "delta": "!",
            }),
        );
        h.flush();
        assert_eq!(h.text_len("msg_1"), 12);
    }

    #[test]
    fn other_sessions_only_update_metadata() {
        let mut h = Harness::new(TransportKind::Web);
        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_2", "msg_1", "prt_1", "hi")}),
        );
        assert_eq!(h.flush(), 0);
        assert_eq!(h.store.message_count(&sid("ses_2")), 0);

        h.send(
            "session.updated",
            json!({"info": {"id": "ses_2", "title": "Background task"}}),
        );
        assert_eq!(
            h.store.session(&sid("ses_2")).unwrap().title.as_deref(),
            Some("Background task")
        );
    }

    #[test]
    fn synthetic_parts_on_user_messages_are_dropped() {
        let mut h = Harness::new(TransportKind::Web);
        let mut part = text_part("ses_1", "msg_u", "prt_s", "<system reminder>");
        part["synthetic"] = json!(true);
        h.send(
            "message.part.updated",
            json!({"part": part.clone(), "info": {"role": "user"}}),
        );
        assert_eq!(h.flush(), 0);

        h.send(
            "message.updated",
            json!({
                "info": {"id": "msg_u", "sessionID": "ses_1", "role": "user"},
                "parts": [part, text_part("ses_1", "msg_u", "prt_1", "fix the build")],
            }),
        );
        let record = h.store.message(&sid("ses_1"), &mid("msg_u")).unwrap();
        assert_eq!(record.parts.len(), 1);
        assert_eq!(record.info.role, Role::User);

        // Role comes from the stored message when the event has none.
        let mut late = text_part("ses_1", "msg_u", "prt_s2", "injected");
        late["synthetic"] = json!(true);
        h.send("message.part.updated", json!({ "part": late }));
        assert_eq!(h.flush(), 0);
    }

    #[test]
    fn user_messages_are_only_created_by_message_updated() {
        let mut h = Harness::new(TransportKind::Web);
        h.send(
            "message.updated",
            json!({"info": {"id": "msg_u", "sessionID": "ses_1", "role": "user"}}),
        );
        assert!(h.store.message(&sid("ses_1"), &mid("msg_u")).is_some());
        assert_eq!(h.store.latest_assistant_id(&sid("ses_1")), None);
        assert!(matches!(h.drain()[..], [ViewNotification::BlockAdded { .. }]));
    }

    #[test]
    fn shrink_guard_on_web_transport() {
        let mut h = Harness::new(TransportKind::Web);
        seed_assistant(&mut h, "msg_1", 100);
        assert_eq!(h.text_len("msg_1"), 100);

        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_1", None),
                "parts": [text_part("ses_1", "msg_1", "prt_1", &"a".repeat(40))],
            }),
        );
        assert_eq!(h.text_len("msg_1"), 100);

        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_1", None),
                "parts": [text_part("ses_1", "msg_1", "prt_1", &"a".repeat(60))],
            }),
        );
        assert_eq!(h.text_len("msg_1"), 60, "within tolerance");

        seed_assistant(&mut h, "msg_2", 100);
        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_2", None),
                "parts": [text_part("ses_1", "msg_2", "prt_1", &"a".repeat(40)), finish_part("msg_2")],
            }),
        );
        assert_eq!(h.text_len("msg_2"), 40);
    }

    #[test]
    fn shrink_guard_on_native_transport_is_strict() {
        let mut h = Harness::new(TransportKind::Native);
        seed_assistant(&mut h, "msg_1", 100);
        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_1", None),
                "parts": [text_part("ses_1", "msg_1", "prt_1", &"a".repeat(99))],
            }),
        );
        assert_eq!(h.text_len("msg_1"), 100);

        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_1", None),
                "parts": [text_part("ses_1", "msg_1", "prt_1", "  "), finish_part("msg_1")],
            }),
        );
        assert_eq!(h.text_len("msg_1"), 100, "finish without content is not enough");

        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_1", None),
                "parts": [text_part("ses_1", "msg_1", "prt_1", "final"), finish_part("msg_1")],
            }),
        );
        assert_eq!(h.text_len("msg_1"), 5);
    }

    #[test]
    fn only_the_latest_assistant_message_completes() {
        let mut h = Harness::new(TransportKind::Web);
        seed_assistant(&mut h, "msg_a", 10);
        seed_assistant(&mut h, "msg_b", 10);
        h.drain();

        h.send(
            "message.updated",
            json!({"info": assistant_info("msg_b", Some(50))}),
        );
        h.send(
            "message.updated",
            json!({"info": assistant_info("msg_a", Some(40))}),
        );

        assert!(h.interpreter.is_completed(&mid("msg_b")));
        assert!(!h.interpreter.is_completed(&mid("msg_a")));
        assert_eq!(h.cursors.get(&sid("ses_1")).unwrap().0, mid("msg_b"));
        let completed: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|n| matches!(n, ViewNotification::MessageCompleted { .. }))
            .collect();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn completion_schedules_debounced_refresh_and_dedupes() {
        let mut h = Harness::new(TransportKind::Web);
        seed_assistant(&mut h, "msg_1", 10);
        h.send(
            "message.updated",
            json!({"info": {"id": "msg_1", "sessionID": "ses_1", "role": "assistant", "status": "completed"}}),
        );
        assert_eq!(
            h.timers.deadline(TimerKind::SessionRefresh),
            Some(h.now + Duration::from_millis(500))
        );
        assert_eq!(h.interpreter.take_refresh(), Some(sid("ses_1")));
        let record = h.store.message(&sid("ses_1"), &mid("msg_1")).unwrap();
        assert!(record.info.time.completed.is_some());
        assert_eq!(
            h.interpreter.tracker().get(&mid("msg_1")).unwrap().phase,
            crate::tracker::StreamPhase::Completed
        );

        h.drain();
        h.send(
            "message.updated",
            json!({"info": assistant_info("msg_1", Some(99))}),
        );
        assert!(h.drain().iter().all(|n| !matches!(n, ViewNotification::MessageCompleted { .. })));
    }

    #[test]
    fn native_completion_waits_for_follow_up() {
        let mut h = Harness::new(TransportKind::Native);
        seed_assistant(&mut h, "msg_1", 10);
        h.send(
            "message.updated",
            json!({"info": assistant_info("msg_1", Some(5))}),
        );
        assert!(h.interpreter.is_deferred(&mid("msg_1")));
        assert!(!h.interpreter.is_completed(&mid("msg_1")));
        assert!(!h.timers.is_armed(TimerKind::NativeCompletion));

        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_1", "final chunk!")}),
        );
        h.flush();
        assert!(h.interpreter.is_completed(&mid("msg_1")));
        assert!(!h.interpreter.is_deferred(&mid("msg_1")));
    }

    #[test]
    fn native_completion_with_finish_marker_is_immediate() {
        let mut h = Harness::new(TransportKind::Native);
        seed_assistant(&mut h, "msg_1", 10);
        h.send(
            "message.updated",
            json!({
                "info": assistant_info("msg_1", Some(5)),
                "parts": [text_part("ses_1", "msg_1", "prt_1", &"a".repeat(10)), finish_part("msg_1")],
            }),
        );
        assert!(h.interpreter.is_completed(&mid("msg_1")));
    }

    #[test]
    fn bridge_signal_resolves_deferred_completion() {
        let mut h = Harness::new(TransportKind::Native);
        seed_assistant(&mut h, "msg_1", 10);
        h.send(
            "message.updated",
            json!({"info": assistant_info("msg_1", Some(5))}),
        );
        let now = h.now;
        h.interpreter
            .on_message_complete(&sid("ses_1"), &mid("msg_1"), now, &mut h.timers);
        assert!(h.interpreter.is_completed(&mid("msg_1")));
    }

    #[test]
    fn native_fallback_timer_completes() {
        let config = EngineConfig {
            native_completion_fallback_ms: Some(5000),
            ..EngineConfig::default()
        };
        let mut h = Harness::with_config(TransportKind::Native, config);
        seed_assistant(&mut h, "msg_1", 10);
        h.send(
            "message.updated",
            json!({"info": assistant_info("msg_1", Some(5))}),
        );
        let deadline = h.now + Duration::from_secs(5);
        assert_eq!(h.timers.deadline(TimerKind::NativeCompletion), Some(deadline));

        h.interpreter
            .on_native_fallback(deadline - Duration::from_millis(1), &mut h.timers);
        assert!(!h.interpreter.is_completed(&mid("msg_1")));
        h.interpreter.on_native_fallback(deadline, &mut h.timers);
        assert!(h.interpreter.is_completed(&mid("msg_1")));
        assert!(!h.timers.is_armed(TimerKind::NativeCompletion));
    }

    #[test]
    fn abort_force_completes_streaming_messages() {
        let mut h = Harness::new(TransportKind::Web);
        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_1", "partial")}),
        );
        h.flush();
        h.send("session.aborted", json!({"sessionID": "ses_1"}));
        assert!(h.interpreter.is_completed(&mid("msg_1")));
        assert!(h.interpreter.tracker().active_ids().is_empty());

        h.send("session.aborted", json!({"sessionID": "ses_2"}));
    }

    #[test]
    fn message_error_forces_completion_even_if_stale() {
        let mut h = Harness::new(TransportKind::Web);
        seed_assistant(&mut h, "msg_a", 10);
        seed_assistant(&mut h, "msg_b", 10);
        h.send(
            "message.updated",
            json!({"info": {
                "id": "msg_a", "sessionID": "ses_1", "role": "assistant",
                "error": {"name": "ProviderAuthError"},
            }}),
        );
        assert!(h.interpreter.is_completed(&mid("msg_a")));
    }

    #[test]
    fn empty_response_detection_is_opt_in() {
        let mut h = Harness::new(TransportKind::Web);
        h.send("message.updated", json!({"info": assistant_info("msg_1", Some(5))}));
        assert!(h.interpreter.is_completed(&mid("msg_1")));
        assert!(h.drain().iter().all(|n| !matches!(n, ViewNotification::EmptyResponse { .. })));

        let config = EngineConfig {
            detect_empty_responses: true,
            ..EngineConfig::default()
        };
        let mut h = Harness::with_config(TransportKind::Web, config);
        h.send("message.updated", json!({"info": assistant_info("msg_1", Some(5))}));
        assert!(h.drain().contains(&ViewNotification::EmptyResponse {
            session_id: sid("ses_1"),
            message_id: mid("msg_1"),
        }));
    }

    #[test]
    fn permissions_are_scoped_to_active_session() {
        let mut h = Harness::new(TransportKind::Web);
        h.send(
            "permission.updated",
            json!({"id": "per_1", "sessionID": "ses_1", "type": "bash", "title": "Run tests"}),
        );
        h.send(
            "permission.asked",
            json!({"id": "per_2", "sessionID": "ses_2", "type": "edit", "title": "Edit file"}),
        );
        assert_eq!(h.store.pending_permissions(&sid("ses_1")).len(), 1);
        assert!(h.store.pending_permissions(&sid("ses_2")).is_empty());
        assert_eq!(
            h.drain(),
            vec![ViewNotification::PermissionPrompt {
                session_id: sid("ses_1"),
                permission_id: PermissionId::new("per_1").unwrap(),
            }]
        );
    }

    #[test]
    fn malformed_events_are_dropped() {
        let mut h = Harness::new(TransportKind::Web);
        h.send("message.part.updated", json!({"part": {"id": ""}}));
        h.send("message.updated", json!({}));
        assert_eq!(h.flush(), 0);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn removed_messages_drop_buffered_parts() {
        let mut h = Harness::new(TransportKind::Web);
        seed_assistant(&mut h, "msg_1", 10);
        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_2", "pending")}),
        );
        h.send(
            "message.removed",
            json!({"sessionID": "ses_1", "messageID": "msg_1"}),
        );
        assert_eq!(h.flush(), 0);
        assert!(h.store.message(&sid("ses_1"), &mid("msg_1")).is_none());
        assert!(h.interpreter.tracker().get(&mid("msg_1")).is_none());
    }

    #[test]
    fn window_eviction_forgets_lifecycle() {
        let store = Arc::new(MemoryStore::with_window(2));
        let mut h = Harness::with_store(TransportKind::Web, EngineConfig::default(), store);
        for message in ["msg_1", "msg_2", "msg_3"] {
            h.send(
                "message.part.updated",
                json!({"part": text_part("ses_1", message, "prt_1", "hi")}),
            );
            h.flush();
        }
        assert!(h.interpreter.tracker().get(&mid("msg_1")).is_none());
        assert!(h.interpreter.tracker().get(&mid("msg_3")).is_some());
    }

    #[test]
    fn session_switch_clears_streaming_state() {
        let mut h = Harness::new(TransportKind::Web);
        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_1", "hi")}),
        );
        h.flush();
        h.send(
            "message.part.updated",
            json!({"part": text_part("ses_1", "msg_1", "prt_2", "buffered")}),
        );
        assert!(h
            .interpreter
            .set_active_session(Some(sid("ses_2")), &mut h.timers));
        assert!(h.interpreter.queue().is_empty());
        assert!(h.interpreter.tracker().snapshot().is_empty());
        assert_eq!(h.interpreter.take_reload(), Some(sid("ses_2")));
        assert!(!h
            .interpreter
            .set_active_session(Some(sid("ses_2")), &mut h.timers));
    }

    #[test]
    fn compaction_of_active_session_requests_reload() {
        let mut h = Harness::new(TransportKind::Web);
        h.store
            .apply_session_metadata(&SessionInfo::new(sid("ses_1")))
            .unwrap();
        h.send("session.compacted", json!({"sessionID": "ses_1"}));
        assert!(h.store.session(&sid("ses_1")).unwrap().time.compacting.is_some());
        assert_eq!(h.interpreter.take_reload(), Some(sid("ses_1")));
    }
}
