//! Per-message streaming lifecycle.
//!
//! The lifecycle map is persistent: every operation takes the current
//! `Arc<LifecycleMap>` and returns the next one. Operations that change
//! nothing return the input `Arc` itself, so readers can skip work with
//! `Arc::ptr_eq`. Batch operations clone the map at most once.

use std::collections::HashMap;
use std::sync::Arc;

use chamber_sync_core::{MessageId, Timestamp};

/// Where a message is in its streaming life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPhase {
    /// Parts are still arriving.
    Streaming,
    /// The session went idle; trailing parts may still land.
    Cooldown,
    /// Completion was confirmed.
    Completed,
}

/// Lifecycle record of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLifecycle {
    /// Current phase.
    pub phase: StreamPhase,
    /// First touch. Never changes once set.
    pub started_at: Timestamp,
    /// Latest touch. Never decreases.
    pub last_update_at: Timestamp,
    /// Completion time, once completed.
    pub completed_at: Option<Timestamp>,
}

impl MessageLifecycle {
    fn started(now: Timestamp) -> Self {
        Self {
            phase: StreamPhase::Streaming,
            started_at: now,
            last_update_at: now,
            completed_at: None,
        }
    }
}

/// Message id to lifecycle record.
pub type LifecycleMap = HashMap<MessageId, MessageLifecycle>;

fn touch_entry(map: &mut LifecycleMap, id: &MessageId, now: Timestamp) {
    match map.get_mut(id) {
        Some(entry) => {
            entry.phase = StreamPhase::Streaming;
            entry.last_update_at = entry.last_update_at.max(now);
        }
        None => {
            map.insert(id.clone(), MessageLifecycle::started(now));
        }
    }
}

/// Mark one message as streaming.
#[must_use]
pub fn touch(map: &Arc<LifecycleMap>, id: &MessageId, now: Timestamp) -> Arc<LifecycleMap> {
    touch_batch(map, std::iter::once(id), now)
}

/// Mark many messages as streaming with a single clone of the map.
///
/// An empty batch returns `map` itself. Duplicate ids collapse.
#[must_use]
pub fn touch_batch<'a, I>(map: &Arc<LifecycleMap>, ids: I, now: Timestamp) -> Arc<LifecycleMap>
where
    I: IntoIterator<Item = &'a MessageId>,
{
    let mut ids = ids.into_iter().peekable();
    if ids.peek().is_none() {
        return Arc::clone(map);
    }
    let mut next = LifecycleMap::clone(map);
    for id in ids {
        touch_entry(&mut next, id, now);
    }
    Arc::new(next)
}

/// Drop records. Returns `map` itself if none of `ids` is present.
#[must_use]
pub fn remove<'a, I>(map: &Arc<LifecycleMap>, ids: I) -> Arc<LifecycleMap>
where
    I: IntoIterator<Item = &'a MessageId>,
{
    let present: Vec<&MessageId> = ids.into_iter().filter(|id| map.contains_key(*id)).collect();
    if present.is_empty() {
        return Arc::clone(map);
    }
    let mut next = LifecycleMap::clone(map);
    for id in present {
        next.remove(id);
    }
    Arc::new(next)
}

/// Move a streaming record to cooldown. Returns `map` itself otherwise.
#[must_use]
pub fn mark_cooldown(map: &Arc<LifecycleMap>, id: &MessageId, now: Timestamp) -> Arc<LifecycleMap> {
    match map.get(id) {
        Some(entry) if entry.phase == StreamPhase::Streaming => {
            let mut next = LifecycleMap::clone(map);
            if let Some(entry) = next.get_mut(id) {
                entry.phase = StreamPhase::Cooldown;
                entry.last_update_at = entry.last_update_at.max(now);
            }
            Arc::new(next)
        }
        _ => Arc::clone(map),
    }
}

/// Mark a message completed, creating the record if needed.
///
/// An already completed record is returned unchanged.
#[must_use]
pub fn mark_completed(
    map: &Arc<LifecycleMap>,
    id: &MessageId,
    now: Timestamp,
) -> Arc<LifecycleMap> {
    if map.get(id).is_some_and(|e| e.phase == StreamPhase::Completed) {
        return Arc::clone(map);
    }
    let mut next = LifecycleMap::clone(map);
    let entry = next
        .entry(id.clone())
        .or_insert_with(|| MessageLifecycle::started(now));
    entry.phase = StreamPhase::Completed;
    entry.last_update_at = entry.last_update_at.max(now);
    entry.completed_at.get_or_insert(now);
    Arc::new(next)
}

/// Owner of the current lifecycle map.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTracker {
    map: Arc<LifecycleMap>,
}

impl LifecycleTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current map. Unchanged maps keep their identity.
    #[must_use]
    pub fn snapshot(&self) -> Arc<LifecycleMap> {
        Arc::clone(&self.map)
    }

    /// Record of one message.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<MessageLifecycle> {
        self.map.get(id).copied()
    }

    /// Ids currently streaming or in cooldown.
    #[must_use]
    pub fn active_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self
            .map
            .iter()
            .filter(|(_, e)| e.phase != StreamPhase::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// See [`touch_batch`].
    pub fn touch_batch<'a, I>(&mut self, ids: I, now: Timestamp)
    where
        I: IntoIterator<Item = &'a MessageId>,
    {
        self.map = touch_batch(&self.map, ids, now);
    }

    /// See [`remove`].
    pub fn remove<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a MessageId>,
    {
        self.map = remove(&self.map, ids);
    }

    /// See [`mark_cooldown`].
    pub fn mark_cooldown(&mut self, id: &MessageId, now: Timestamp) {
        self.map = mark_cooldown(&self.map, id, now);
    }

    /// See [`mark_completed`].
    pub fn mark_completed(&mut self, id: &MessageId, now: Timestamp) {
        self.map = mark_completed(&self.map, id, now);
    }

    /// Forget every record.
    pub fn clear(&mut self) {
        if !self.map.is_empty() {
            self.map = Arc::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MessageId {
        MessageId::new(s).unwrap()
    }

    #[test]
    fn empty_batch_keeps_identity() {
        let map = touch(&Arc::default(), &id("msg_1"), 10);
        let same = touch_batch(&map, [], 20);
        assert!(Arc::ptr_eq(&map, &same));
    }

    #[test]
    fn removing_absent_ids_keeps_identity() {
        let map = touch(&Arc::default(), &id("msg_1"), 10);
        let same = remove(&map, &[id("msg_2"), id("msg_3")]);
        assert!(Arc::ptr_eq(&map, &same));

        let next = remove(&map, &[id("msg_1")]);
        assert!(!Arc::ptr_eq(&map, &next));
        assert!(next.is_empty());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn touch_preserves_started_at_and_never_goes_back() {
        let map = touch(&Arc::default(), &id("msg_1"), 100);
        let map = touch(&map, &id("msg_1"), 250);
        let map = touch(&map, &id("msg_1"), 200);
        let entry = map[&id("msg_1")];
        assert_eq!(entry.started_at, 100);
        assert_eq!(entry.last_update_at, 250);
        assert_eq!(entry.phase, StreamPhase::Streaming);
    }

    #[test]
    fn batch_collapses_duplicates() {
        let ids = [id("msg_1"), id("msg_2"), id("msg_1")];
        let map = touch_batch(&Arc::default(), &ids, 5);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn cooldown_only_applies_to_streaming() {
        let map = touch(&Arc::default(), &id("msg_1"), 1);
        let cooled = mark_cooldown(&map, &id("msg_1"), 2);
        assert_eq!(cooled[&id("msg_1")].phase, StreamPhase::Cooldown);
        let same = mark_cooldown(&cooled, &id("msg_1"), 3);
        assert!(Arc::ptr_eq(&cooled, &same));
        let absent = mark_cooldown(&cooled, &id("msg_9"), 3);
        assert!(Arc::ptr_eq(&cooled, &absent));
    }

    #[test]
    fn completion_stamps_once() {
        let map = touch(&Arc::default(), &id("msg_1"), 1);
        let done = mark_completed(&map, &id("msg_1"), 7);
        assert_eq!(done[&id("msg_1")].completed_at, Some(7));
        let again = mark_completed(&done, &id("msg_1"), 9);
        assert!(Arc::ptr_eq(&done, &again));
    }

    #[test]
    fn tracker_reports_active_ids() {
        let mut tracker = LifecycleTracker::new();
        tracker.touch_batch(&[id("msg_2"), id("msg_1")], 1);
        tracker.mark_completed(&id("msg_1"), 2);
        assert_eq!(tracker.active_ids(), vec![id("msg_2")]);

        let before = tracker.snapshot();
        tracker.remove(&[id("msg_9")]);
        assert!(Arc::ptr_eq(&before, &tracker.snapshot()));
        tracker.clear();
        assert!(tracker.snapshot().is_empty());
    }
}
