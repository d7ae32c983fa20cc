//! HTTP client for the agent server's REST API.
//!
//! This module provides a typed client for the reads the sync engine needs:
//! the session list, one session's metadata, a session's messages, and the
//! health probe.

use std::sync::Arc;

use async_trait::async_trait;
use chamber_sync_core::{MessageRecord, SessionId, SessionInfo};
use chamber_sync_store::{SessionSource, StoreError};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        Self::Source(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(alias = "error")]
    message: String,
}

/// Client for the server REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    directory: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    /// Create a new API client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the server (e.g., "http://localhost:4096")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Create a client that reuses an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            directory: Arc::new(RwLock::new(None)),
        }
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The shared HTTP client.
    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Working directory sent with every request.
    pub fn directory(&self) -> Option<String> {
        self.directory.read().clone()
    }

    /// Scope subsequent requests to a working directory.
    pub fn set_directory(&self, directory: Option<String>) {
        *self.directory.write() = directory;
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .headers(Self::headers());
        match self.directory() {
            Some(directory) => request.query(&[("directory", directory)]),
            None => request,
        }
    }

    /// Handle API error responses.
    async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = match response.json::<ApiErrorResponse>().await {
            Ok(err) => err.message,
            Err(_) => "Unknown error".to_string(),
        };
        ClientError::Api { status, message }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.get(path).send().await?;

        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Ask the server whether it is healthy.
    ///
    /// Any 2xx answer counts as healthy unless the body reports a status other
    /// than `ok`.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let response = self.get("/health").send().await?;
        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "health check failed");
            return Ok(false);
        }
        let healthy = match response.json::<HealthResponse>().await {
            Ok(body) => body.status.as_deref().is_none_or(|s| s == "ok"),
            Err(_) => true,
        };
        Ok(healthy)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// List all sessions.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        self.get_json("/session").await
    }

    /// Get one session's metadata.
    pub async fn get_session(&self, session_id: &SessionId) -> Result<SessionInfo, ClientError> {
        self.get_json(&format!("/session/{session_id}")).await
    }

    /// List a session's messages with their parts.
    pub async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<MessageRecord>, ClientError> {
        self.get_json(&format!("/session/{session_id}/message")).await
    }
}

#[async_trait]
impl SessionSource for ApiClient {
    async fn fetch_messages(
        &self,
        session_id: &SessionId,
    ) -> chamber_sync_store::Result<Vec<MessageRecord>> {
        Ok(self.list_messages(session_id).await?)
    }

    async fn fetch_sessions(&self) -> chamber_sync_store::Result<Vec<SessionInfo>> {
        Ok(self.list_sessions().await?)
    }

    async fn fetch_session(&self, session_id: &SessionId) -> chamber_sync_store::Result<SessionInfo> {
        Ok(self.get_session(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn lists_messages_with_directory_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/ses_1/message"))
            .and(query_param("directory", "/work/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "info": {"id": "msg_1", "sessionID": "ses_1", "role": "user"},
                    "parts": [{"id": "prt_1", "sessionID": "ses_1", "messageID": "msg_1", "type": "text", "text": "hi"}],
                },
                {"info": {"id": "msg_2", "sessionID": "ses_1", "role": "assistant"}},
            ])))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri());
        client.set_directory(Some("/work/app".into()));
        let messages = client
            .fetch_messages(&SessionId::new("ses_1").unwrap())
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].parts.len(), 1);
        assert!(messages[1].parts.is_empty());
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/ses_missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"message": "session not found"})),
            )
            .mount(&server)
            .await;

        let client = ApiClient::new(format!("{}/", server.uri()));
        let err = client
            .get_session(&SessionId::new("ses_missing").unwrap())
            .await
            .unwrap_err();
        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "session not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn health_reads_status_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;
        assert!(ApiClient::new(server.uri()).health().await.unwrap());

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        assert!(!ApiClient::new(down.uri()).health().await.unwrap());
    }

    #[tokio::test]
    async fn source_errors_map_to_store_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = ApiClient::new(server.uri())
            .fetch_sessions()
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Source(_)));
    }
}
