//! The event loop.
//!
//! [`SyncRuntime`] is the single task that owns the connection manager, the
//! interpreter, and the timer table. Everything reaches it through channels:
//! control commands from [`SyncHandle`], transport messages tagged with their
//! subscription id, and results of spawned probes and loads. It is the only
//! writer of engine state and of message content in the store.
//!
//! A message reload fetches on a spawned task and is applied here. Live
//! updates that arrive while a reload is in flight are held and replayed
//! after the snapshot lands, so the snapshot never overwrites them.

use std::collections::VecDeque;
use std::sync::Arc;

use chamber_sync_core::{MessageRecord, SessionId};
use chamber_sync_store::{
    load_sessions, refresh_session, PermissionStore, ReadCursorSink, SessionSource, SessionStore,
    StoreError,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::connection::{ConnectionCommand, ConnectionManager, HostSignal};
use crate::error::{EngineError, Result, TransportError};
use crate::interpreter::{Collaborators, EventInterpreter, ViewNotification};
use crate::scheduler::{TimerKind, Timers};
use crate::status::StatusSink;
use crate::transport::{Subscription, SubscriptionId, Transport, TransportMessage, TransportSink};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Everything the runtime talks to.
#[derive(Clone)]
pub struct RuntimeDeps {
    /// Event source.
    pub transport: Arc<dyn Transport>,
    /// Server reads for reloads and refreshes.
    pub source: Arc<dyn SessionSource>,
    /// Transcript store.
    pub store: Arc<dyn SessionStore>,
    /// Permission prompts.
    pub permissions: Arc<dyn PermissionStore>,
    /// Read cursors.
    pub cursors: Arc<dyn ReadCursorSink>,
    /// Connection status output.
    pub status: Arc<dyn StatusSink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Start,
    Stop,
    Host(HostSignal),
    SetActiveSession(Option<SessionId>),
    SetDirectory(Option<String>),
}

#[derive(Debug)]
enum TaskResult {
    Probe {
        id: SubscriptionId,
        result: std::result::Result<bool, TransportError>,
    },
    Reloaded {
        generation: u64,
        session_id: SessionId,
        result: std::result::Result<Vec<MessageRecord>, StoreError>,
    },
    Refreshed {
        session_id: SessionId,
        result: std::result::Result<bool, StoreError>,
    },
}

/// Cloneable control handle for a running [`SyncRuntime`].
#[derive(Clone)]
pub struct SyncHandle {
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    notifications: broadcast::Sender<ViewNotification>,
}

impl SyncHandle {
    fn send(&self, control: Control) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        self.control.send(control).map_err(|_| EngineError::Shutdown)
    }

    /// Begin delivering events.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if the runtime has exited.
    pub fn start(&self) -> Result<()> {
        self.send(Control::Start)
    }

    /// Tear down the subscription and every timer. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if the runtime has exited.
    pub fn stop(&self) -> Result<()> {
        self.send(Control::Stop)
    }

    /// Report a visibility, focus, or network change.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if the runtime has exited.
    pub fn host_signal(&self, signal: HostSignal) -> Result<()> {
        self.send(Control::Host(signal))
    }

    /// Select the session whose content is applied.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if the runtime has exited.
    pub fn set_active_session(&self, session_id: Option<SessionId>) -> Result<()> {
        self.send(Control::SetActiveSession(session_id))
    }

    /// Scope the transport to a working directory and resubscribe.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if the runtime has exited.
    pub fn set_directory(&self, directory: Option<String>) -> Result<()> {
        self.send(Control::SetDirectory(directory))
    }

    /// Stop the runtime task and everything it spawned.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called or the
    /// runtime exited.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled() || self.control.is_closed()
    }

    /// Subscribe to view notifications.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<ViewNotification> {
        self.notifications.subscribe()
    }
}

/// The sync engine's event loop.
pub struct SyncRuntime {
    transport: Arc<dyn Transport>,
    source: Arc<dyn SessionSource>,
    store: Arc<dyn SessionStore>,
    connection: ConnectionManager,
    interpreter: EventInterpreter,
    timers: Timers,
    subscription: Option<(SubscriptionId, Box<dyn Subscription>)>,
    /// Live messages waiting for the in-flight reload. `Some` while one runs.
    held: Option<VecDeque<(SubscriptionId, TransportMessage)>>,
    reload_generation: u64,
    control_rx: mpsc::UnboundedReceiver<Control>,
    transport_tx: mpsc::UnboundedSender<(SubscriptionId, TransportMessage)>,
    transport_rx: mpsc::UnboundedReceiver<(SubscriptionId, TransportMessage)>,
    task_tx: mpsc::UnboundedSender<TaskResult>,
    task_rx: mpsc::UnboundedReceiver<TaskResult>,
    cancel: CancellationToken,
}

impl SyncRuntime {
    /// Build a runtime and its handle. Nothing runs until [`run`](Self::run).
    #[must_use]
    pub fn new(deps: RuntimeDeps, config: &EngineConfig) -> (Self, SyncHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let cancel = CancellationToken::new();

        let interpreter = EventInterpreter::new(
            config,
            Collaborators {
                store: Arc::clone(&deps.store),
                permissions: deps.permissions,
                cursors: deps.cursors,
            },
            deps.transport.kind(),
            notifications.clone(),
        );

        let runtime = Self {
            connection: ConnectionManager::new(config, deps.status),
            interpreter,
            transport: deps.transport,
            source: deps.source,
            store: deps.store,
            timers: Timers::new(),
            subscription: None,
            held: None,
            reload_generation: 0,
            control_rx,
            transport_tx,
            transport_rx,
            task_tx,
            task_rx,
            cancel: cancel.clone(),
        };
        let handle = SyncHandle {
            control: control_tx,
            cancel,
            notifications,
        };
        (runtime, handle)
    }

    /// Build a runtime and run it on a new task.
    #[must_use]
    pub fn spawn(deps: RuntimeDeps, config: &EngineConfig) -> (SyncHandle, JoinHandle<()>) {
        let (runtime, handle) = Self::new(deps, config);
        (handle, tokio::spawn(runtime.run()))
    }

    /// Run until the handle shuts the runtime down or every handle is dropped.
    pub async fn run(mut self) {
        info!(transport = ?self.transport.kind(), "sync runtime started");
        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                control = self.control_rx.recv() => match control {
                    Some(control) => self.on_control(control),
                    None => break,
                },
                Some((id, message)) = self.transport_rx.recv() => self.on_transport(id, message),
                Some(result) = self.task_rx.recv() => self.on_task(result),
                () = sleep_until(deadline) => self.on_timers(),
            }
        }
        self.stop();
        self.cancel.cancel();
        info!("sync runtime stopped");
    }

    fn on_control(&mut self, control: Control) {
        let now = Instant::now();
        trace!(?control, "control");
        match control {
            Control::Start => {
                let commands = self.connection.start(now, &mut self.timers);
                self.execute(commands);
            }
            Control::Stop => self.stop(),
            Control::Host(signal) => {
                let commands = self.connection.on_host_signal(signal, now, &mut self.timers);
                self.execute(commands);
            }
            Control::SetActiveSession(session_id) => {
                self.interpreter
                    .set_active_session(session_id, &mut self.timers);
            }
            Control::SetDirectory(directory) => {
                debug!(directory = ?directory, "changing directory");
                self.transport.set_directory(directory);
                let commands = self.connection.resubscribe(now, &mut self.timers);
                self.execute(commands);
            }
        }
        self.spawn_pending_reload();
    }

    fn on_transport(&mut self, id: SubscriptionId, message: TransportMessage) {
        let now = Instant::now();
        match message {
            TransportMessage::Open => {
                self.connection.on_open(id, now);
            }
            TransportMessage::Error(error) => {
                let commands = self.connection.on_error(id, &error, now, &mut self.timers);
                self.execute(commands);
            }
            message => {
                if !self.connection.on_event(id, now) {
                    return;
                }
                if let Some(held) = self.held.as_mut() {
                    trace!(subscription = %id, held = held.len(), "holding update for reload");
                    held.push_back((id, message));
                } else {
                    self.deliver(message, now);
                }
            }
        }
        self.spawn_pending_reload();
    }

    fn deliver(&mut self, message: TransportMessage, now: Instant) {
        match message {
            TransportMessage::Event(event) => {
                self.interpreter.handle_event(&event, now, &mut self.timers);
            }
            TransportMessage::MessageComplete {
                session_id,
                message_id,
            } => self.interpreter.on_message_complete(
                &session_id,
                &message_id,
                now,
                &mut self.timers,
            ),
            TransportMessage::SessionActivity { session_id, phase } => {
                self.interpreter.on_session_activity(&session_id, phase);
            }
            TransportMessage::Open | TransportMessage::Error(_) => {}
        }
    }

    fn apply_reload(&mut self, session_id: &SessionId, messages: Vec<MessageRecord>) {
        let count = messages.len();
        match self.store.replace_messages(session_id, messages) {
            Ok(dropped) => {
                debug!(
                    session_id = %session_id,
                    count,
                    dropped = dropped.len(),
                    "reloaded messages"
                );
                self.interpreter.on_reloaded(session_id, &dropped);
            }
            Err(err) => warn!(%err, session_id = %session_id, "failed to store reloaded messages"),
        }
    }

    /// Replay held updates from the current subscription in arrival order.
    fn release_held(&mut self, now: Instant) {
        let Some(held) = self.held.take() else {
            return;
        };
        if !held.is_empty() {
            debug!(count = held.len(), "replaying held updates");
        }
        for (id, message) in held {
            if self.connection.is_current(id) {
                self.deliver(message, now);
            }
        }
    }

    fn on_task(&mut self, result: TaskResult) {
        let now = Instant::now();
        match result {
            TaskResult::Probe { id, result } => {
                let commands = self
                    .connection
                    .on_probe_result(id, result, now, &mut self.timers);
                self.execute(commands);
            }
            TaskResult::Reloaded {
                generation,
                session_id,
                result,
            } => {
                if generation == self.reload_generation {
                    match result {
                        Ok(messages) => self.apply_reload(&session_id, messages),
                        Err(err) => {
                            warn!(%err, session_id = %session_id, "failed to reload messages");
                        }
                    }
                    self.release_held(now);
                } else {
                    debug!(session_id = %session_id, "discarding superseded reload");
                }
            }
            TaskResult::Refreshed { session_id, result } => match result {
                Ok(changed) => debug!(session_id = %session_id, changed, "session refreshed"),
                Err(err) => warn!(%err, session_id = %session_id, "failed to refresh session"),
            },
        }
        self.spawn_pending_reload();
    }

    fn on_timers(&mut self) {
        let now = Instant::now();
        for kind in self.timers.take_due(now) {
            match kind {
                TimerKind::Reconnect | TimerKind::StalenessCheck => {
                    let commands = self.connection.on_timer(kind, now, &mut self.timers);
                    self.execute(commands);
                }
                TimerKind::Frame => {
                    self.interpreter.flush(now, &mut self.timers);
                }
                TimerKind::SessionRefresh => self.spawn_refresh(),
                TimerKind::NativeCompletion => {
                    self.interpreter.on_native_fallback(now, &mut self.timers);
                }
            }
        }
        self.spawn_pending_reload();
    }

    fn stop(&mut self) {
        self.interpreter.cancel_pending(&mut self.timers);
        let commands = self.connection.stop(&mut self.timers);
        self.execute(commands);
        self.timers.clear();
    }

    fn execute(&mut self, commands: Vec<ConnectionCommand>) {
        for command in commands {
            match command {
                ConnectionCommand::Subscribe(id) => {
                    let sink = TransportSink::new(id, self.transport_tx.clone());
                    let subscription = self.transport.subscribe(sink);
                    if let Some((old_id, old)) = self.subscription.replace((id, subscription)) {
                        debug!(subscription = %old_id, "replacing subscription");
                        old.unsubscribe();
                    }
                }
                ConnectionCommand::Unsubscribe(id) => {
                    if self.subscription.as_ref().is_some_and(|(current, _)| *current == id) {
                        if let Some((_, subscription)) = self.subscription.take() {
                            debug!(subscription = %id, "unsubscribing");
                            subscription.unsubscribe();
                        }
                    }
                }
                ConnectionCommand::Probe(id) => self.spawn_probe(id),
                ConnectionCommand::SoftResync => self.interpreter.request_reload(),
            }
        }
    }

    fn spawn_probe(&self, id: SubscriptionId) {
        let transport = Arc::clone(&self.transport);
        let tx = self.task_tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = transport.check_health() => result,
            };
            let _ = tx.send(TaskResult::Probe { id, result });
        });
    }

    fn spawn_pending_reload(&mut self) {
        let Some(session_id) = self.interpreter.take_reload() else {
            return;
        };
        self.reload_generation += 1;
        let generation = self.reload_generation;
        self.held.get_or_insert_with(VecDeque::new);
        debug!(session_id = %session_id, generation, "reloading messages");
        let source = Arc::clone(&self.source);
        let tx = self.task_tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = source.fetch_messages(&session_id) => result,
            };
            let _ = tx.send(TaskResult::Reloaded {
                generation,
                session_id,
                result,
            });
        });
    }

    fn spawn_refresh(&mut self) {
        let Some(session_id) = self.interpreter.take_refresh() else {
            return;
        };
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let tx = self.task_tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let refresh = async {
                if let Err(err) = load_sessions(source.as_ref(), store.as_ref()).await {
                    warn!(%err, "failed to reload session list");
                }
                refresh_session(source.as_ref(), store.as_ref(), &session_id).await
            };
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = refresh => result,
            };
            let _ = tx.send(TaskResult::Refreshed { session_id, result });
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
