//! Desktop bridge relay.
//!
//! A long-lived relay that holds one upstream connection to the server's
//! global event stream and fans events out to any number of local
//! subscribers. On the way through it:
//!
//! - unwraps `{ directory, payload }` envelopes,
//! - drops assistant `message.updated` events that carry no parts,
//! - detects completion (`status == "completed"`, or a `step-finish` part with
//!   reason `stop` inside a `message.updated` snapshot or on its own in
//!   `message.part.updated`) and emits one `MessageComplete` per message,
//! - turns `session.status` into `SessionActivity`,
//! - keeps the last 256 items for late subscribers.
//!
//! The relay reconnects on its own, starting at 500 ms and doubling up to
//! 8 s, resuming with `Last-Event-ID`. [`BridgeTransport`] exposes the relay
//! to the engine as a native transport.
//!
//! Endpoint: GET /global/event

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chamber_sync_core::message::has_finish_marker;
use chamber_sync_core::{ActivityPhase, MessageId, Role, ServerEvent, SessionId, StreamEvent};
use chamber_sync_engine::{
    BoundedIdSet, Subscription, TaskSubscription, Transport, TransportError, TransportKind,
    TransportSink,
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::ApiClient;
use crate::sse::open_stream;

/// Path of the global event stream.
pub const GLOBAL_EVENT_PATH: &str = "/global/event";

/// Items kept for late subscribers.
pub const REPLAY_CAPACITY: usize = 256;

const RELAY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RELAY_MAX_DELAY: Duration = Duration::from_secs(8);
const COMPLETED_CAPACITY: usize = 1000;
const COMPLETED_EVICT: usize = 200;

/// What the relay hands to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayItem {
    /// Upstream connected.
    Connected,
    /// Upstream failed; the relay will retry.
    Disconnected(String),
    /// A server event.
    Event(StreamEvent),
    /// A message finished.
    MessageComplete {
        /// Session.
        session_id: SessionId,
        /// Message.
        message_id: MessageId,
    },
    /// A session changed phase.
    SessionActivity {
        /// Session.
        session_id: SessionId,
        /// Phase.
        phase: ActivityPhase,
    },
}

impl RelayItem {
    const fn is_replayable(&self) -> bool {
        !matches!(self, Self::Connected | Self::Disconnected(_))
    }
}

/// Per-event relay decisions: filtering, completion detection, activity.
#[derive(Debug)]
pub struct RelayFilter {
    completed: BoundedIdSet<MessageId>,
}

impl Default for RelayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayFilter {
    /// Create a filter with an empty completion set.
    pub fn new() -> Self {
        Self {
            completed: BoundedIdSet::new(COMPLETED_CAPACITY, COMPLETED_EVICT),
        }
    }

    /// Decide what to relay for one upstream event.
    pub fn inspect(&mut self, event: StreamEvent) -> Vec<RelayItem> {
        match ServerEvent::classify(&event) {
            Ok(ServerEvent::MessageUpdated { info, parts }) => {
                let parts = parts.unwrap_or_default();
                if info.role == Role::Assistant && parts.is_empty() {
                    trace!(
                        message_id = %info.id,
                        status = info.status.as_deref().unwrap_or("pending"),
                        "dropping empty assistant message.updated"
                    );
                    return Vec::new();
                }

                let mut items = vec![RelayItem::Event(event)];
                let status_completed = info.status.as_deref() == Some("completed");
                let step_finish = has_finish_marker(&parts);
                if (status_completed || step_finish) && self.completed.insert(info.id.clone()) {
                    info!(
                        message_id = %info.id,
                        status_completed,
                        step_finish,
                        "completion detected"
                    );
                    items.push(RelayItem::MessageComplete {
                        session_id: info.session_id,
                        message_id: info.id,
                    });
                }
                items
            }
            Ok(ServerEvent::MessagePartUpdated { part, .. }) => {
                let mut items = vec![RelayItem::Event(event)];
                if part.is_finish_marker() && self.completed.insert(part.message_id.clone()) {
                    info!(
                        message_id = %part.message_id,
                        part_id = %part.id,
                        "completion detected from step-finish part"
                    );
                    items.push(RelayItem::MessageComplete {
                        session_id: part.session_id,
                        message_id: part.message_id,
                    });
                }
                items
            }
            Ok(ServerEvent::SessionStatus { session_id, phase }) => vec![
                RelayItem::Event(event),
                RelayItem::SessionActivity { session_id, phase },
            ],
            _ => vec![RelayItem::Event(event)],
        }
    }
}

struct Shared {
    items: broadcast::Sender<RelayItem>,
    replay: Mutex<VecDeque<RelayItem>>,
    subscribers: RwLock<usize>,
    connected: RwLock<bool>,
}

impl Shared {
    fn publish(&self, item: RelayItem) {
        let mut replay = self.replay.lock();
        if item.is_replayable() {
            if replay.len() == REPLAY_CAPACITY {
                replay.pop_front();
            }
            replay.push_back(item.clone());
        }
        // No subscribers is fine.
        let _ = self.items.send(item);
    }

    fn set_connected(&self, connected: bool) {
        *self.connected.write() = connected;
    }
}

/// Decrements the subscriber count when a subscriber goes away.
struct SubscriberGuard {
    shared: Arc<Shared>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut count = self.shared.subscribers.write();
        *count = count.saturating_sub(1);
    }
}

/// The relay process: one upstream stream, many local subscribers.
pub struct BridgeRelay {
    api: ApiClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeRelay {
    /// Start relaying `/global/event` from the server behind `api`.
    pub fn start(api: ApiClient) -> Arc<Self> {
        let (items, _) = broadcast::channel(REPLAY_CAPACITY * 4);
        let shared = Arc::new(Shared {
            items,
            replay: Mutex::new(VecDeque::with_capacity(REPLAY_CAPACITY)),
            subscribers: RwLock::new(0),
            connected: RwLock::new(false),
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay_loop(
            api.clone(),
            Arc::clone(&shared),
            cancel.clone(),
        ));
        Arc::new(Self {
            api,
            shared,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the upstream loop. Subscribers see the channel close.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Items kept for late subscribers, oldest first.
    pub fn replay_buffer(&self) -> Vec<RelayItem> {
        self.shared.replay.lock().iter().cloned().collect()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        *self.shared.subscribers.read()
    }

    /// Returns true while the upstream stream is open.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.read()
    }

    /// Scope the next upstream connection to a working directory.
    pub fn set_directory(&self, directory: Option<String>) {
        self.api.set_directory(directory);
    }

    fn register(&self) -> SubscriberGuard {
        *self.shared.subscribers.write() += 1;
        SubscriberGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The replay buffer and a receiver for everything after it, without a gap.
    fn attach(&self) -> (Vec<RelayItem>, broadcast::Receiver<RelayItem>) {
        let replay = self.shared.replay.lock();
        let rx = self.shared.items.subscribe();
        (replay.iter().cloned().collect(), rx)
    }
}

impl Drop for BridgeRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay_loop(api: ApiClient, shared: Arc<Shared>, cancel: CancellationToken) {
    let mut delay = RELAY_INITIAL_DELAY;
    let mut last_event_id: Option<String> = None;
    let mut filter = RelayFilter::new();
    info!(base_url = api.base_url(), "starting bridge relay");

    loop {
        let response = tokio::select! {
            () = cancel.cancelled() => break,
            response = open_stream(&api, GLOBAL_EVENT_PATH, last_event_id.clone()) => response,
        };
        match response {
            Ok(response) => {
                info!(directory = ?api.directory(), "bridge upstream connected");
                shared.set_connected(true);
                shared.publish(RelayItem::Connected);
                let outcome = pump(response, &shared, &mut filter, &mut last_event_id, &cancel).await;
                shared.set_connected(false);
                let Some(err) = outcome else {
                    break;
                };
                warn!(%err, "bridge upstream ended");
                shared.publish(RelayItem::Disconnected(err.to_string()));
                delay = RELAY_INITIAL_DELAY;
            }
            Err(err) => {
                warn!(%err, "bridge upstream connect failed");
                shared.publish(RelayItem::Disconnected(err.to_string()));
            }
        }

        debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            last_event_id = ?last_event_id,
            "bridge relay reconnecting"
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RELAY_MAX_DELAY);
    }
    info!("bridge relay stopped");
}

/// Relay one upstream stream. Returns `None` if cancelled, otherwise the
/// reason it ended.
async fn pump(
    response: reqwest::Response,
    shared: &Shared,
    filter: &mut RelayFilter,
    last_event_id: &mut Option<String>,
    cancel: &CancellationToken,
) -> Option<TransportError> {
    let mut events = response.bytes_stream().eventsource();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return None,
            next = events.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if !event.id.is_empty() {
                    *last_event_id = Some(event.id);
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                match StreamEvent::from_json(&event.data) {
                    Ok(parsed) => {
                        for item in filter.inspect(parsed) {
                            shared.publish(item);
                        }
                    }
                    Err(err) => trace!(%err, "skipping unparseable upstream event"),
                }
            }
            Some(Err(err)) => return Some(TransportError::Stream(err.to_string())),
            None => return Some(TransportError::Closed),
        }
    }
}

/// The relay as an engine transport.
#[derive(Clone)]
pub struct BridgeTransport {
    relay: Arc<BridgeRelay>,
}

impl BridgeTransport {
    /// Wrap a running relay.
    pub fn new(relay: Arc<BridgeRelay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    fn subscribe(&self, sink: TransportSink) -> Box<dyn Subscription> {
        let cancel = CancellationToken::new();
        let task = forward(Arc::clone(&self.relay), sink, cancel.clone());
        Box::new(TaskSubscription::new(cancel, tokio::spawn(task)))
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        self.relay
            .api
            .health()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    fn set_directory(&self, directory: Option<String>) {
        self.relay.set_directory(directory);
    }
}

/// Returns false once the subscription should end.
fn deliver(sink: &TransportSink, item: RelayItem) -> bool {
    match item {
        RelayItem::Connected => sink.open(),
        RelayItem::Disconnected(hint) => {
            sink.error(TransportError::Stream(hint));
            false
        }
        RelayItem::Event(event) => sink.event(event),
        RelayItem::MessageComplete {
            session_id,
            message_id,
        } => sink.message_complete(session_id, message_id),
        RelayItem::SessionActivity { session_id, phase } => {
            sink.session_activity(session_id, phase)
        }
    }
}

async fn forward(relay: Arc<BridgeRelay>, sink: TransportSink, cancel: CancellationToken) {
    let _guard = relay.register();
    let (replay, mut rx) = relay.attach();
    debug!(
        subscription = %sink.id(),
        replay = replay.len(),
        subscribers = relay.subscriber_count(),
        "bridge subscriber attached"
    );

    if relay.is_connected() && !sink.open() {
        return;
    }
    for item in replay {
        if !deliver(&sink, item) {
            return;
        }
    }

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => return,
            item = rx.recv() => item,
        };
        match item {
            Ok(item) => {
                if !deliver(&sink, item) {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                sink.error(TransportError::Stream(format!(
                    "bridge subscriber lagged by {skipped} events"
                )));
                return;
            }
            Err(RecvError::Closed) => {
                sink.error(TransportError::Closed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chamber_sync_engine::{SubscriptionId, TransportMessage};
    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(kind: &str, properties: serde_json::Value) -> StreamEvent {
        StreamEvent::new(kind, properties)
    }

    fn assistant_update(status: Option<&str>, parts: serde_json::Value) -> StreamEvent {
        let mut info = json!({"id": "msg_1", "sessionID": "ses_1", "role": "assistant"});
        if let Some(status) = status {
            info["status"] = json!(status);
        }
        event("message.updated", json!({"info": info, "parts": parts}))
    }

    fn text_part() -> serde_json::Value {
        json!({"id": "prt_1", "sessionID": "ses_1", "messageID": "msg_1", "type": "text", "text": "hi"})
    }

    #[test]
    fn drops_empty_assistant_updates() {
        let mut filter = RelayFilter::new();
        assert!(filter
            .inspect(assistant_update(Some("completed"), json!([])))
            .is_empty());

        let user = event(
            "message.updated",
            json!({"info": {"id": "msg_0", "sessionID": "ses_1", "role": "user"}}),
        );
        assert_eq!(filter.inspect(user.clone()), vec![RelayItem::Event(user)]);
    }

    #[test]
    fn detects_completion_once_per_message() {
        let mut filter = RelayFilter::new();
        let streaming = filter.inspect(assistant_update(None, json!([text_part()])));
        assert_eq!(streaming.len(), 1);

        let finish = json!({
            "id": "prt_2", "sessionID": "ses_1", "messageID": "msg_1",
            "type": "step-finish", "reason": "stop",
        });
        let items = filter.inspect(assistant_update(None, json!([text_part(), finish])));
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            RelayItem::MessageComplete {
                session_id: SessionId::new("ses_1").unwrap(),
                message_id: MessageId::new("msg_1").unwrap(),
            }
        );

        let again = filter.inspect(assistant_update(Some("completed"), json!([text_part()])));
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn step_finish_part_completes_once() {
        let mut filter = RelayFilter::new();
        let step = |reason: &str| {
            event(
                "message.part.updated",
                json!({"part": {
                    "id": "prt_2", "sessionID": "ses_1", "messageID": "msg_1",
                    "type": "step-finish", "reason": reason,
                }}),
            )
        };

        // A tool-call step does not end the message.
        assert_eq!(filter.inspect(step("tool-calls")).len(), 1);

        let items = filter.inspect(step("stop"));
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], RelayItem::Event(_)));
        assert_eq!(
            items[1],
            RelayItem::MessageComplete {
                session_id: SessionId::new("ses_1").unwrap(),
                message_id: MessageId::new("msg_1").unwrap(),
            }
        );

        // The same message finishing again through either path is not repeated.
        assert_eq!(filter.inspect(step("stop")).len(), 1);
        let update = filter.inspect(assistant_update(Some("completed"), json!([text_part()])));
        assert_eq!(update.len(), 1);
    }

    #[test]
    fn session_status_becomes_activity() {
        let mut filter = RelayFilter::new();
        let items = filter.inspect(event(
            "session.status",
            json!({"sessionID": "ses_1", "status": {"type": "busy"}}),
        ));
        assert_eq!(
            items[1],
            RelayItem::SessionActivity {
                session_id: SessionId::new("ses_1").unwrap(),
                phase: ActivityPhase::Busy,
            }
        );
    }

    #[tokio::test]
    async fn relays_upstream_to_subscribers() {
        let server = MockServer::start().await;
        let envelope = |event: serde_json::Value| {
            format!("data: {}\n\n", json!({"directory": "/work", "payload": event}))
        };
        let finish = json!({
            "id": "prt_2", "sessionID": "ses_1", "messageID": "msg_1",
            "type": "step-finish", "reason": "stop",
        });
        let body = [
            envelope(json!({"type": "message.updated", "properties": {
                "info": {"id": "msg_1", "sessionID": "ses_1", "role": "assistant"}, "parts": [],
            }})),
            envelope(json!({"type": "message.part.updated", "properties": {"part": text_part()}})),
            envelope(json!({"type": "message.updated", "properties": {
                "info": {"id": "msg_1", "sessionID": "ses_1", "role": "assistant"},
                "parts": [text_part(), finish],
            }})),
        ]
        .concat();
        Mock::given(method("GET"))
            .and(path(GLOBAL_EVENT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let relay = BridgeRelay::start(ApiClient::new(server.uri()));
        let transport = BridgeTransport::new(Arc::clone(&relay));
        assert_eq!(transport.kind(), TransportKind::Native);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = transport.subscribe(TransportSink::new(SubscriptionId::new(1), tx));

        let mut messages = Vec::new();
        while let Some((_, message)) = rx.recv().await {
            let done = matches!(message, TransportMessage::Error(_));
            messages.push(message);
            if done {
                break;
            }
        }

        let updates = messages
            .iter()
            .filter(|m| matches!(m, TransportMessage::Event(e) if e.kind == "message.updated"))
            .count();
        assert_eq!(updates, 1, "empty assistant update is filtered");
        let completions = messages
            .iter()
            .filter(|m| matches!(m, TransportMessage::MessageComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(messages
            .iter()
            .any(|m| matches!(m, TransportMessage::Event(e) if e.kind == "message.part.updated")));
        assert!(relay.replay_buffer().len() >= 3);

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        relay.stop();
    }

    #[test]
    fn replay_buffer_is_bounded() {
        let (items, _) = broadcast::channel(8);
        let shared = Shared {
            items,
            replay: Mutex::new(VecDeque::new()),
            subscribers: RwLock::new(0),
            connected: RwLock::new(false),
        };
        shared.publish(RelayItem::Connected);
        for i in 0..(REPLAY_CAPACITY + 10) {
            shared.publish(RelayItem::Event(event(&format!("custom.{i}"), json!({}))));
        }
        let replay = shared.replay.lock();
        assert_eq!(replay.len(), REPLAY_CAPACITY);
        assert_eq!(
            replay.front(),
            Some(&RelayItem::Event(event("custom.10", json!({}))))
        );
    }
}
