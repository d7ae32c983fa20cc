//! Frame-batched part updates.
//!
//! Tokens can arrive many times per frame. The queue buffers them and asks for
//! a single `Frame` timer; when it fires, everything buffered becomes one
//! [`FlushBatch`] and one store commit.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chamber_sync_core::{MessageId, Part, PartId, SessionId, StreamingPart};
use chamber_sync_store::MessageParts;
use tokio::time::Instant;
use tracing::trace;

use crate::scheduler::{TimerKind, Timers};

/// Everything buffered during one frame, grouped by `(session, message)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushBatch {
    groups: Vec<MessageParts>,
}

impl FlushBatch {
    /// Per-message groups in first-seen order.
    #[must_use]
    pub fn groups(&self) -> &[MessageParts] {
        &self.groups
    }

    /// Distinct sessions in the batch.
    #[must_use]
    pub fn session_ids(&self) -> BTreeSet<&SessionId> {
        self.groups.iter().map(|g| &g.session_id).collect()
    }

    /// Distinct messages in the batch.
    #[must_use]
    pub fn message_ids(&self) -> BTreeSet<&MessageId> {
        self.groups.iter().map(|g| &g.message_id).collect()
    }

    /// Total parts across all groups.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.groups.iter().map(|g| g.parts.len()).sum()
    }

    /// Returns true if nothing was buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Buffers streaming parts until the next display frame.
#[derive(Debug)]
pub struct BatchedUpdateQueue {
    buffer: Vec<StreamingPart>,
    frame_interval: Duration,
    frame_pending: bool,
    flush_count: u64,
}

impl BatchedUpdateQueue {
    /// Create a queue that flushes `frame_interval` after the first enqueue.
    #[must_use]
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            buffer: Vec::new(),
            frame_interval,
            frame_pending: false,
            flush_count: 0,
        }
    }

    /// Buffer an item and request a frame if none is pending.
    ///
    /// Returns true if this call requested the frame.
    pub fn enqueue(&mut self, item: StreamingPart, now: Instant, timers: &mut Timers) -> bool {
        self.buffer.push(item);
        if self.frame_pending {
            return false;
        }
        self.frame_pending = true;
        timers.arm_in(TimerKind::Frame, now, self.frame_interval);
        true
    }

    /// Drain the buffer into one batch. Returns `None` if it was empty.
    pub fn flush(&mut self, timers: &mut Timers) -> Option<FlushBatch> {
        self.frame_pending = false;
        timers.cancel(TimerKind::Frame);
        if self.buffer.is_empty() {
            return None;
        }

        let mut groups: Vec<MessageParts> = Vec::new();
        let mut index: HashMap<(SessionId, MessageId), usize> = HashMap::new();
        for item in self.buffer.drain(..) {
            let key = (item.session_id, item.message_id);
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push(MessageParts::new(key.0.clone(), key.1.clone(), item.role));
                groups.len() - 1
            });
            groups[slot].parts.push(item.part);
        }

        self.flush_count += 1;
        trace!(
            flush = self.flush_count,
            groups = groups.len(),
            "flushing streaming parts"
        );
        Some(FlushBatch { groups })
    }

    /// Discard the buffer and the pending frame without committing.
    pub fn cancel_pending(&mut self, timers: &mut Timers) {
        self.buffer.clear();
        self.frame_pending = false;
        timers.cancel(TimerKind::Frame);
    }

    /// Drop buffered parts a newer snapshot of `message_id` replaces.
    ///
    /// With `parts` `None`, every buffered part of the message is dropped.
    pub fn supersede(&mut self, message_id: &MessageId, parts: Option<&[Part]>) -> usize {
        let before = self.buffer.len();
        self.buffer.retain(|item| {
            if &item.message_id != message_id {
                return true;
            }
            match parts {
                Some(parts) => !parts.iter().any(|p| p.id == item.part.id),
                None => false,
            }
        });
        before - self.buffer.len()
    }

    /// Returns true if any part of `message_id` is buffered.
    #[must_use]
    pub fn has_message(&self, message_id: &MessageId) -> bool {
        self.buffer.iter().any(|item| &item.message_id == message_id)
    }

    /// Text of the newest buffered copy of a part, if one is waiting.
    #[must_use]
    pub fn buffered_text(&self, message_id: &MessageId, part_id: &PartId) -> Option<&str> {
        self.buffer
            .iter()
            .rev()
            .find(|item| &item.message_id == message_id && &item.part.id == part_id)
            .and_then(|item| item.part.text.as_deref())
    }

    /// Buffered item count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns true if a frame is requested.
    #[must_use]
    pub const fn is_frame_pending(&self) -> bool {
        self.frame_pending
    }

    /// Number of non-empty flushes so far.
    #[must_use]
    pub const fn flush_count(&self) -> u64 {
        self.flush_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chamber_sync_core::Role;
    use serde_json::json;

    fn item(session: usize, message: usize, part: usize) -> StreamingPart {
        let part: Part = serde_json::from_value(json!({
            "id": format!("prt_{part}"),
            "sessionID": format!("ses_{session}"),
            "messageID": format!("msg_{session}_{message}"),
            "type": "text",
            "text": "x",
        }))
        .unwrap();
        StreamingPart {
            session_id: part.session_id.clone(),
            message_id: part.message_id.clone(),
            part,
            role: Role::Assistant,
        }
    }

    #[test]
    fn many_enqueues_make_one_flush() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let mut queue = BatchedUpdateQueue::new(Duration::from_millis(16));

        for i in 0..100 {
            let session = i % 5;
            let message = i % 3;
            queue.enqueue(item(session, message, i), now, &mut timers);
        }
        assert_eq!(
            timers.deadline(TimerKind::Frame),
            Some(now + Duration::from_millis(16))
        );

        let batch = queue.flush(&mut timers).unwrap();
        assert_eq!(queue.flush_count(), 1);
        assert_eq!(batch.session_ids().len(), 5);
        assert_eq!(batch.message_ids().len(), 15);
        assert_eq!(batch.part_count(), 100);
        assert!(queue.flush(&mut timers).is_none());
        assert_eq!(queue.flush_count(), 1);
    }

    #[test]
    fn only_first_enqueue_requests_a_frame() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let mut queue = BatchedUpdateQueue::new(Duration::from_millis(16));
        assert!(queue.enqueue(item(0, 0, 0), now, &mut timers));
        assert!(!queue.enqueue(item(0, 0, 1), now + Duration::from_millis(5), &mut timers));
        assert_eq!(
            timers.deadline(TimerKind::Frame),
            Some(now + Duration::from_millis(16))
        );
    }

    #[test]
    fn cancel_discards_without_flushing() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let mut queue = BatchedUpdateQueue::new(Duration::from_millis(16));
        queue.enqueue(item(0, 0, 0), now, &mut timers);
        queue.cancel_pending(&mut timers);
        assert!(queue.is_empty());
        assert!(!timers.is_armed(TimerKind::Frame));
        assert!(queue.flush(&mut timers).is_none());
        assert_eq!(queue.flush_count(), 0);
    }

    #[test]
    fn buffered_text_prefers_newest_copy() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let mut queue = BatchedUpdateQueue::new(Duration::from_millis(16));
        let mut newer = item(0, 0, 1);
        newer.part.text = Some("xy".to_string());
        queue.enqueue(item(0, 0, 1), now, &mut timers);
        queue.enqueue(newer.clone(), now, &mut timers);

        assert_eq!(queue.buffered_text(&newer.message_id, &newer.part.id), Some("xy"));
        let other = item(0, 0, 2);
        assert_eq!(queue.buffered_text(&other.message_id, &other.part.id), None);
    }

    #[test]
    fn supersede_drops_replaced_parts() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let mut queue = BatchedUpdateQueue::new(Duration::from_millis(16));
        queue.enqueue(item(0, 0, 1), now, &mut timers);
        queue.enqueue(item(0, 0, 2), now, &mut timers);
        queue.enqueue(item(0, 1, 1), now, &mut timers);

        let snapshot = [item(0, 0, 1).part];
        assert_eq!(queue.supersede(&item(0, 0, 0).message_id, Some(&snapshot)), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.supersede(&item(0, 1, 0).message_id, None), 1);
        assert_eq!(queue.len(), 1);
    }
}
