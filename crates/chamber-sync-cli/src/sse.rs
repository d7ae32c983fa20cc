//! Server-sent events transport.
//!
//! Subscribes to the server's `/event` endpoint and feeds every event into a
//! [`TransportSink`]. One subscription is one HTTP request; any failure ends
//! it and is reported to the engine, which decides when to reconnect.
//!
//! Endpoint: GET /event?directory=<dir>

use std::sync::Arc;

use async_trait::async_trait;
use chamber_sync_core::StreamEvent;
use chamber_sync_engine::{
    Subscription, TaskSubscription, Transport, TransportError, TransportKind, TransportSink,
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::ApiClient;

/// Header used to resume a stream after a reconnect.
pub const LAST_EVENT_ID: &str = "Last-Event-ID";

/// SSE transport for the web server.
#[derive(Debug, Clone)]
pub struct SseTransport {
    api: ApiClient,
    path: String,
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl SseTransport {
    /// Create a transport reading `/event` through `api`.
    pub fn new(api: ApiClient) -> Self {
        Self::with_path(api, "/event")
    }

    /// Create a transport reading a different event path.
    pub fn with_path(api: ApiClient, path: impl Into<String>) -> Self {
        Self {
            api,
            path: path.into(),
            last_event_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Id of the last event received, if the server sends ids.
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Web
    }

    fn subscribe(&self, sink: TransportSink) -> Box<dyn Subscription> {
        let cancel = CancellationToken::new();
        let task = read_stream(
            self.api.clone(),
            self.path.clone(),
            Arc::clone(&self.last_event_id),
            sink,
            cancel.clone(),
        );
        Box::new(TaskSubscription::new(cancel, tokio::spawn(task)))
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        self.api
            .health()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    fn set_directory(&self, directory: Option<String>) {
        self.api.set_directory(directory);
    }
}

/// Send the event stream request, resuming from `last_event_id` if given.
pub(crate) async fn open_stream(
    api: &ApiClient,
    path: &str,
    last_event_id: Option<String>,
) -> Result<reqwest::Response, TransportError> {
    let mut request = api
        .http()
        .get(format!("{}{path}", api.base_url()))
        .header(ACCEPT, "text/event-stream");
    if let Some(directory) = api.directory() {
        request = request.query(&[("directory", directory)]);
    }
    if let Some(id) = last_event_id {
        request = request.header(LAST_EVENT_ID, id);
    }

    let response = request
        .send()
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    if !response.status().is_success() {
        return Err(TransportError::Status(response.status().as_u16()));
    }
    Ok(response)
}

async fn read_stream(
    api: ApiClient,
    path: String,
    last_event_id: Arc<Mutex<Option<String>>>,
    sink: TransportSink,
    cancel: CancellationToken,
) {
    let resume = last_event_id.lock().clone();
    let response = tokio::select! {
        () = cancel.cancelled() => return,
        response = open_stream(&api, &path, resume) => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            sink.error(err);
            return;
        }
    };

    debug!(subscription = %sink.id(), "event stream open");
    if !sink.open() {
        return;
    }

    let mut events = response.bytes_stream().eventsource();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = events.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if !event.id.is_empty() {
                    *last_event_id.lock() = Some(event.id.clone());
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                match StreamEvent::from_json(&event.data) {
                    Ok(parsed) => {
                        if !sink.event(parsed) {
                            return;
                        }
                    }
                    Err(err) => trace!(%err, "skipping unparseable event"),
                }
            }
            Some(Err(err)) => {
                sink.error(TransportError::Stream(err.to_string()));
                return;
            }
            None => {
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
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(events: &[(&str, &str)]) -> String {
        events
            .iter()
            .map(|(id, data)| format!("id: {id}\ndata: {data}\n\n"))
            .collect()
    }

    async fn collect(transport: &SseTransport) -> Vec<TransportMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TransportSink::new(SubscriptionId::new(7), tx);
        let _subscription = transport.subscribe(sink);

        let mut messages = Vec::new();
        while let Some((id, message)) = rx.recv().await {
            assert_eq!(id, SubscriptionId::new(7));
            let done = matches!(message, TransportMessage::Error(_));
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    }

    #[tokio::test]
    async fn streams_events_and_reports_close() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            ("1", r#"{"type":"server.connected","properties":{}}"#),
            (
                "2",
                r#"{"directory":"/work","payload":{"type":"session.idle","properties":{"sessionID":"ses_1"}}}"#,
            ),
            ("3", "not json"),
        ]);
        Mock::given(method("GET"))
            .and(path("/event"))
            .and(query_param("directory", "/work"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri());
        let transport = SseTransport::new(api);
        transport.set_directory(Some("/work".into()));
        let messages = collect(&transport).await;

        assert_eq!(messages[0], TransportMessage::Open);
        let kinds: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                TransportMessage::Event(e) => Some(e.kind.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["server.connected", "session.idle"]);
        assert_eq!(
            messages.last(),
            Some(&TransportMessage::Error(TransportError::Closed))
        );
        assert_eq!(transport.last_event_id().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn resumes_with_last_event_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/event"))
            .and(header(LAST_EVENT_ID, "41"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&[("42", r#"{"type":"server.heartbeat"}"#)])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = SseTransport::new(ApiClient::new(server.uri()));
        *transport.last_event_id.lock() = Some("41".into());
        let messages = collect(&transport).await;
        assert!(messages.contains(&TransportMessage::Open));
        assert_eq!(transport.last_event_id().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn http_errors_are_reported_before_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/event"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let transport = SseTransport::new(ApiClient::new(server.uri()));
        let messages = collect(&transport).await;
        assert_eq!(
            messages,
            vec![TransportMessage::Error(TransportError::Status(502))]
        );
    }

    #[tokio::test]
    async fn health_probe_uses_the_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let transport = SseTransport::new(ApiClient::new(server.uri()));
        assert_eq!(transport.check_health().await, Ok(true));
    }
}
