//! Client for the upstream agent API.

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::UpstreamConfig;
use crate::sse::extract::truthy;

use super::error::ProxyError;

/// Calls the upstream "new session" and "send message" endpoints.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayBody<'a> {
    #[serde(rename = "app_name")]
    app_name: &'a str,
    #[serde(rename = "user_id")]
    user_id: &'a str,
    session_id: &'a str,
    new_message: NewMessage<'a>,
}

#[derive(Serialize)]
struct NewMessage<'a> {
    role: &'static str,
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

impl UpstreamClient {
    /// Create a client for `config`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Upstream configuration.
    #[must_use]
    pub const fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Fail unless the endpoints needed for this call and the token are set.
    ///
    /// Only the presence of each variable is logged.
    pub fn require_credentials(&self, needs_interaction: bool) -> Result<(), ProxyError> {
        let session = !self.config.session_endpoint.is_empty();
        let interaction = !needs_interaction || !self.config.interaction_endpoint.is_empty();
        let token = !self.config.bearer_token.is_empty();
        if session && interaction && token {
            return Ok(());
        }
        error!(
            session_endpoint = session,
            interaction_endpoint = !self.config.interaction_endpoint.is_empty(),
            bearer_token = token,
            "Missing upstream configuration"
        );
        Err(ProxyError::MissingCredentials)
    }

    /// Ask the upstream for a new session id.
    pub async fn create_session(&self) -> Result<String, ProxyError> {
        info!("Creating new upstream session");
        let response = self
            .client
            .post(&self.config.session_endpoint)
            .bearer_auth(&self.config.bearer_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_else(|_| "No error details".to_string());
            error!(status = status.as_u16(), %detail, "Session creation failed");
            return Err(ProxyError::Upstream(format!(
                "Failed to create session: {} ({})",
                status.canonical_reason().unwrap_or_default(),
                status.as_u16()
            )));
        }

        let data: Value = response.json().await?;
        let session_id = extract_session_id(&data).ok_or_else(|| {
            error!("No session id in upstream session response");
            ProxyError::NoSession
        })?;
        debug!(%session_id, "Upstream session created");
        Ok(session_id)
    }

    /// Send one user message and return the streaming response.
    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<reqwest::Response, ProxyError> {
        let body = RelayBody {
            app_name: &self.config.app_name,
            user_id: &self.config.user_id,
            session_id,
            new_message: NewMessage {
                role: "user",
                parts: [TextPart { text: message }],
            },
        };

        let response = self
            .client
            .post(&self.config.interaction_endpoint)
            .bearer_auth(&self.config.bearer_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_else(|_| "No error details".to_string());
        error!(status = status.as_u16(), %detail, "Upstream relay failed");
        Err(relay_failure(status, &detail))
    }
}

/// Session id from a bare JSON string or a `session_id`, `sessionId` or `id` field.
#[must_use]
pub fn extract_session_id(data: &Value) -> Option<String> {
    let render = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match data {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(fields) => ["session_id", "sessionId", "id"]
            .iter()
            .filter_map(|name| fields.get(*name))
            .find(|v| truthy(v))
            .map(render),
        _ => None,
    }
}

fn relay_failure(status: StatusCode, detail: &str) -> ProxyError {
    if status == StatusCode::NOT_FOUND && detail.contains("Session not found") {
        return ProxyError::SessionExpired;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProxyError::UpstreamRateLimited;
    }

    let error = serde_json::from_str::<Value>(detail)
        .ok()
        .and_then(|json| json.get("error").filter(|e| truthy(e)).cloned());
    if let Some(error) = error {
        let code_429 = error.get("code").and_then(Value::as_i64) == Some(429);
        let exhausted = error.get("status").and_then(Value::as_str) == Some("RESOURCE_EXHAUSTED");
        if code_429 || exhausted {
            return ProxyError::UpstreamRateLimited;
        }
        if let Some(message) = error.get("message").filter(|m| truthy(m)) {
            return ProxyError::Upstream(match message {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }

    ProxyError::Upstream(format!(
        "Failed to send message: {}",
        status.canonical_reason().unwrap_or_default()
    ))
}
