//! Connection lifecycle.
//!
//! [`ConnectionManager`] is a synchronous state machine. It owns the current
//! subscription id, the reconnect counter, and the `Reconnect` and
//! `StalenessCheck` timers, and answers every input with the
//! [`ConnectionCommand`]s the runtime must carry out.
//!
//! ```text
//!   start ──permitted──▶ Connecting ──open──▶ Connected
//!     │                      ▲                    │
//!     │ not permitted        │ backoff            │ error / stale probe
//!     ▼                      │                    ▼
//!   Paused / Offline ◀── revoked ──── Error / Reconnecting
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::scheduler::{TimerKind, Timers};
use crate::status::{ConnectionStatus, StatusSink};
use crate::transport::SubscriptionId;

/// A change reported by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// The document became visible or hidden.
    Visibility(bool),
    /// The window gained or lost focus.
    Focus(bool),
    /// The network came up or went down.
    Online(bool),
}

/// What the host currently reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    /// Document is visible.
    pub visible: bool,
    /// Window has focus.
    pub focused: bool,
    /// Network is up.
    pub online: bool,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            visible: true,
            focused: true,
            online: true,
        }
    }
}

impl HostState {
    /// A live connection is allowed in the foreground (visible, or hidden but
    /// focused as in split views) while online.
    #[must_use]
    pub const fn permits_connection(&self) -> bool {
        (self.visible || self.focused) && self.online
    }

    fn apply(&mut self, signal: HostSignal) {
        match signal {
            HostSignal::Visibility(v) => self.visible = v,
            HostSignal::Focus(f) => self.focused = f,
            HostSignal::Online(o) => self.online = o,
        }
    }
}

/// Work the runtime must do on behalf of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Open a transport subscription under this id.
    Subscribe(SubscriptionId),
    /// Tear down the subscription with this id.
    Unsubscribe(SubscriptionId),
    /// Run a health probe on behalf of this subscription.
    Probe(SubscriptionId),
    /// Reload the active session before live delivery resumes.
    SoftResync,
}

/// Base reconnect delay for a 1-indexed attempt, before jitter.
///
/// Doubles from 1 s up to 8 s for the first three attempts, then restarts at
/// 2 s and doubles up to 32 s.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let millis = if attempt <= 3 {
        1000u64.saturating_mul(1u64 << (attempt - 1)).min(8000)
    } else {
        let exp = (attempt - 4).min(16);
        2000u64.saturating_mul(1u64 << exp).min(32_000)
    };
    Duration::from_millis(millis)
}

/// Owns the subscription, backoff, gating, and staleness state.
pub struct ConnectionManager {
    sink: Arc<dyn StatusSink>,
    status: ConnectionStatus,
    host: HostState,
    started: bool,
    pending_resume: bool,
    current: Option<SubscriptionId>,
    next_subscription: u64,
    attempts: u32,
    last_event_at: Option<Instant>,
    probe_in_flight: bool,
    staleness_interval: Duration,
    staleness_threshold: Duration,
    jitter_max_ms: u64,
}

impl ConnectionManager {
    /// Create a stopped manager.
    #[must_use]
    pub fn new(config: &EngineConfig, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            status: ConnectionStatus::Idle,
            host: HostState::default(),
            started: false,
            pending_resume: false,
            current: None,
            next_subscription: 0,
            attempts: 0,
            last_event_at: None,
            probe_in_flight: false,
            staleness_interval: config.staleness_check_interval(),
            staleness_threshold: config.staleness_threshold(),
            jitter_max_ms: config.reconnect_jitter_ms,
        }
    }

    /// Last published status.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Reconnect attempts since the last confirmed open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The current subscription, if any.
    #[must_use]
    pub const fn current(&self) -> Option<SubscriptionId> {
        self.current
    }

    /// Current host state.
    #[must_use]
    pub const fn host(&self) -> HostState {
        self.host
    }

    /// Returns true between `start` and `stop`.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Returns true if a connection is owed once permission returns.
    #[must_use]
    pub const fn pending_resume(&self) -> bool {
        self.pending_resume
    }

    /// Returns true if `id` is the live subscription.
    #[must_use]
    pub fn is_current(&self, id: SubscriptionId) -> bool {
        self.current == Some(id)
    }

    fn publish(&mut self, status: ConnectionStatus, hint: Option<String>) {
        self.status = status;
        self.sink.set_event_stream_status(status, hint);
    }

    fn pause(&mut self) {
        self.pending_resume = true;
        let status = if self.host.online {
            ConnectionStatus::Paused
        } else {
            ConnectionStatus::Offline
        };
        self.publish(status, None);
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=self.jitter_max_ms))
    }

    fn silence(&self, now: Instant) -> Duration {
        self.last_event_at
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at))
    }

    /// Begin delivering events, or wait for permission.
    pub fn start(&mut self, now: Instant, timers: &mut Timers) -> Vec<ConnectionCommand> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        if !self.host.permits_connection() {
            info!(host = ?self.host, "connection not permitted; waiting");
            self.pause();
            return Vec::new();
        }
        self.attempts = 0;
        self.connect(now, timers)
    }

    /// Tear everything down. Safe to call repeatedly.
    pub fn stop(&mut self, timers: &mut Timers) -> Vec<ConnectionCommand> {
        timers.cancel(TimerKind::Reconnect);
        timers.cancel(TimerKind::StalenessCheck);
        let mut commands = Vec::new();
        if let Some(id) = self.current.take() {
            commands.push(ConnectionCommand::Unsubscribe(id));
        }
        self.started = false;
        self.pending_resume = false;
        self.attempts = 0;
        self.probe_in_flight = false;
        self.last_event_at = None;
        if self.status != ConnectionStatus::Idle {
            debug!("connection stopped");
            self.publish(ConnectionStatus::Idle, None);
        }
        commands
    }

    /// Drop the current subscription and open a new one right away, e.g.
    /// after the transport's directory changed.
    pub fn resubscribe(&mut self, now: Instant, timers: &mut Timers) -> Vec<ConnectionCommand> {
        if !self.started || !self.host.permits_connection() {
            return Vec::new();
        }
        self.attempts = 0;
        self.connect(now, timers)
    }

    fn connect(&mut self, now: Instant, timers: &mut Timers) -> Vec<ConnectionCommand> {
        let mut commands = Vec::with_capacity(2);
        if let Some(old) = self.current.take() {
            commands.push(ConnectionCommand::Unsubscribe(old));
        }
        self.next_subscription += 1;
        let id = SubscriptionId::new(self.next_subscription);
        self.current = Some(id);
        self.pending_resume = false;
        self.probe_in_flight = false;
        self.last_event_at = Some(now);

        timers.cancel(TimerKind::Reconnect);
        timers.arm_in(TimerKind::StalenessCheck, now, self.staleness_interval);

        let status = if self.attempts == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting
        };
        self.publish(status, None);
        debug!(subscription = %id, attempt = self.attempts, "subscribing");
        commands.push(ConnectionCommand::Subscribe(id));
        commands
    }

    fn resume(&mut self, now: Instant, timers: &mut Timers) -> Vec<ConnectionCommand> {
        info!(host = ?self.host, "connection permitted again; resyncing");
        self.attempts = 0;
        let mut commands = vec![ConnectionCommand::SoftResync];
        commands.extend(self.connect(now, timers));
        commands
    }

    fn schedule_reconnect(&mut self, now: Instant, timers: &mut Timers) {
        self.attempts = self.attempts.saturating_add(1);
        let delay = backoff_delay(self.attempts) + self.jitter();
        timers.cancel(TimerKind::StalenessCheck);
        timers.arm_in(TimerKind::Reconnect, now, delay);
        debug!(
            attempt = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
    }

    /// The transport confirmed the stream is open.
    ///
    /// Returns false for a stale subscription.
    pub fn on_open(&mut self, id: SubscriptionId, now: Instant) -> bool {
        if !self.is_current(id) {
            trace!(subscription = %id, "ignoring open from stale subscription");
            return false;
        }
        self.attempts = 0;
        self.last_event_at = Some(now);
        self.publish(ConnectionStatus::Connected, None);
        info!(subscription = %id, "event stream connected");
        true
    }

    /// Any event arrived. Returns false for a stale subscription, whose
    /// events must be dropped.
    pub fn on_event(&mut self, id: SubscriptionId, now: Instant) -> bool {
        if !self.is_current(id) {
            trace!(subscription = %id, "ignoring event from stale subscription");
            return false;
        }
        self.last_event_at = Some(now);
        true
    }

    /// The transport failed.
    pub fn on_error(
        &mut self,
        id: SubscriptionId,
        error: &TransportError,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<ConnectionCommand> {
        if !self.is_current(id) {
            trace!(subscription = %id, %error, "ignoring error from stale subscription");
            return Vec::new();
        }
        warn!(subscription = %id, %error, "event stream failed");
        self.current = None;
        self.probe_in_flight = false;
        self.schedule_reconnect(now, timers);
        self.publish(ConnectionStatus::Error, Some(error.to_string()));
        vec![ConnectionCommand::Unsubscribe(id)]
    }

    /// The host environment changed.
    pub fn on_host_signal(
        &mut self,
        signal: HostSignal,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<ConnectionCommand> {
        let was_permitted = self.host.permits_connection();
        let regained = matches!(
            signal,
            HostSignal::Visibility(true) | HostSignal::Focus(true) | HostSignal::Online(true)
        );
        self.host.apply(signal);
        let permitted = self.host.permits_connection();
        if !self.started {
            return Vec::new();
        }

        match (was_permitted, permitted) {
            (true, false) => {
                timers.cancel(TimerKind::Reconnect);
                timers.cancel(TimerKind::StalenessCheck);
                let mut commands = Vec::new();
                if let Some(id) = self.current.take() {
                    commands.push(ConnectionCommand::Unsubscribe(id));
                }
                self.probe_in_flight = false;
                info!(host = ?self.host, "connection no longer permitted; pausing");
                self.pause();
                commands
            }
            (false, true) => self.resume(now, timers),
            (true, true) if regained && self.current.is_none() => self.resume(now, timers),
            (false, false) => {
                self.pause();
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// A connection timer fired.
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<ConnectionCommand> {
        match kind {
            TimerKind::Reconnect => {
                if self.started && self.host.permits_connection() && self.current.is_none() {
                    self.connect(now, timers)
                } else {
                    Vec::new()
                }
            }
            TimerKind::StalenessCheck => self.check_staleness(now, timers),
            _ => Vec::new(),
        }
    }

    fn check_staleness(&mut self, now: Instant, timers: &mut Timers) -> Vec<ConnectionCommand> {
        let Some(id) = self.current else {
            return Vec::new();
        };
        if !self.host.permits_connection() {
            return Vec::new();
        }
        timers.arm_in(TimerKind::StalenessCheck, now, self.staleness_interval);
        let silence = self.silence(now);
        if silence <= self.staleness_threshold || self.probe_in_flight {
            return Vec::new();
        }
        self.probe_in_flight = true;
        debug!(
            silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
            "no events; probing server health"
        );
        vec![ConnectionCommand::Probe(id)]
    }

    /// A health probe finished. An unhealthy or failed probe forces a
    /// reconnect without going through `on_error`.
    pub fn on_probe_result(
        &mut self,
        id: SubscriptionId,
        result: Result<bool, TransportError>,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<ConnectionCommand> {
        if !self.is_current(id) {
            return Vec::new();
        }
        self.probe_in_flight = false;
        match result {
            Ok(true) => {
                debug!("health probe ok");
                Vec::new()
            }
            Ok(false) | Err(_) => {
                let hint = format!("no events for {}s; reconnecting", self.silence(now).as_secs());
                warn!(subscription = %id, %hint, "event stream stalled");
                self.current = None;
                self.schedule_reconnect(now, timers);
                self.publish(ConnectionStatus::Reconnecting, Some(hint));
                vec![ConnectionCommand::Unsubscribe(id)]
            }
        }
    }
}
