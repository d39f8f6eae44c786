//! HTTP transport between the chat client and the proxy.

use std::io;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::chat::errors::{ChatError, ChatResult};
use crate::session::ResponseStatus;

/// Header carrying the session id on proxy replies.
pub const SESSION_HEADER: &str = "x-session-id";

/// Body of a relay request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// User text.
    pub message: String,
    /// Current session id; empty asks the proxy to mint one.
    pub session_id: String,
}

/// Byte stream of an event-stream reply.
pub type ReplyBody = BoxStream<'static, io::Result<Bytes>>;

/// Successful relay reply.
pub struct ProxyReply {
    /// HTTP status.
    pub status: u16,
    /// Session id the proxy used, when reported.
    pub session_id: Option<String>,
    /// Event-stream body.
    pub body: ReplyBody,
}

impl ResponseStatus for ProxyReply {
    fn ok_flag(&self) -> Option<bool> {
        Some((200..300).contains(&self.status))
    }

    fn status_code(&self) -> Option<i64> {
        Some(i64::from(self.status))
    }
}

/// Freshly minted session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SessionCreated {
    /// New session id.
    pub session_id: String,
}

impl ResponseStatus for SessionCreated {}

/// Calls the chat client makes to the proxy.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Relay one message. Non-success statuses come back as [`ChatError::Api`].
    async fn send(&self, request: &ChatRequest) -> ChatResult<ProxyReply>;

    /// Ask the proxy for a new session.
    async fn create_session(&self) -> ChatResult<SessionCreated>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// [`ChatTransport`] over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Create a transport for the proxy at `proxy_url`.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(proxy_url: &str) -> ChatResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base: Url::parse(proxy_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> ChatResult<Url> {
        Ok(self.base.join(path)?)
    }

    async fn api_error(response: reqwest::Response) -> ChatError {
        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));
        ChatError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> ChatResult<ProxyReply> {
        let response = self
            .client
            .post(self.endpoint("/api/chatbot")?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(status = %response.status(), ?session_id, "Relay accepted");

        Ok(ProxyReply {
            status: response.status().as_u16(),
            session_id,
            body: response.bytes_stream().map_err(io::Error::other).boxed(),
        })
    }

    async fn create_session(&self) -> ChatResult<SessionCreated> {
        let response = self.client.post(self.endpoint("/api/session")?).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_reads_header_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chatbot"))
            .and(body_json(serde_json::json!({"message": "hi", "session_id": ""})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Session-Id", "s-1")
                    .set_body_raw("data: {\"text\":\"yo\"}\n\n", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri()).unwrap();
        let reply = transport
            .send(&ChatRequest {
                message: "hi".to_string(),
                session_id: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.session_id.as_deref(), Some("s-1"));
        let chunks: Vec<Bytes> = reply.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"data: {\"text\":\"yo\"}\n\n".to_vec());
    }

    #[tokio::test]
    async fn test_error_body_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chatbot"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "Your session has expired. Please try again."
            })))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri()).unwrap();
        let err = transport
            .send(&ChatRequest {
                message: "hi".to_string(),
                session_id: "old".to_string(),
            })
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ChatError::Api { status: 404, .. }));
        assert_eq!(err.to_string(), "Your session has expired. Please try again.");
    }

    #[tokio::test]
    async fn test_create_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"session_id": "fresh"})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri()).unwrap();
        assert_eq!(transport.create_session().await.unwrap().session_id, "fresh");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(HttpTransport::new("not a url"), Err(ChatError::Url(_))));
    }
}
