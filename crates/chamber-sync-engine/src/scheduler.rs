//! Named timers for the runtime loop.
//!
//! The state machines never sleep. They arm deadlines in a [`Timers`] table and
//! the runtime waits for the earliest one. Deadlines use `tokio::time::Instant`
//! so paused-clock tests drive them deterministically.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// The timers the engine uses. At most one deadline per kind is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Next reconnect attempt after backoff.
    Reconnect,
    /// Periodic staleness check.
    StalenessCheck,
    /// Next display frame for the batched update queue.
    Frame,
    /// Debounced session list and metadata refresh.
    SessionRefresh,
    /// Fallback completion of deferred native messages.
    NativeCompletion,
}

/// A table of pending deadlines, one per [`TimerKind`].
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Timers {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` for `at`, replacing any pending deadline.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Arm `kind` for `delay` after `now`.
    pub fn arm_in(&mut self, kind: TimerKind, now: Instant, delay: Duration) {
        self.arm(kind, now + delay);
    }

    /// Cancel `kind`. Returns true if it was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    /// Returns true if `kind` is pending.
    #[must_use]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Deadline of `kind`, if pending.
    #[must_use]
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// The earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, *kind))
            .collect();
        due.sort();
        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_due_orders_by_deadline() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm_in(TimerKind::StalenessCheck, now, Duration::from_millis(30));
        timers.arm_in(TimerKind::Frame, now, Duration::from_millis(16));
        timers.arm_in(TimerKind::Reconnect, now, Duration::from_secs(2));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(16)));
        let due = timers.take_due(now + Duration::from_millis(40));
        assert_eq!(due, vec![TimerKind::Frame, TimerKind::StalenessCheck]);
        assert!(timers.is_armed(TimerKind::Reconnect));
        assert!(!timers.is_armed(TimerKind::Frame));
    }

    #[test]
    fn clear_cancels_everything() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::Reconnect, now);
        timers.arm(TimerKind::SessionRefresh, now);
        timers.clear();
        assert_eq!(timers.next_deadline(), None);
        assert!(!timers.cancel(TimerKind::Reconnect));
    }
}
