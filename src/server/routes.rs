//! HTTP route handlers for the folio proxy.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::services::ServeDir;
use tracing::{debug, info};

use crate::sse::extract::truthy;

use super::client_ip::ClientIp;
use super::error::ProxyError;
use super::state::AppState;

/// Header carrying the session id on success.
pub const SESSION_HEADER: &str = "X-Session-Id";

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/api/session", post(create_session))
        .route("/api/chatbot", post(relay_message));

    let router = match &state.config.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "folio-proxy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Mint a new upstream session.
async fn create_session(
    State(state): State<Arc<AppState>>,
    ClientIp(client): ClientIp,
) -> Result<Response, ProxyError> {
    state.check_quota(&client)?;
    state.upstream.require_credentials(false)?;

    let session_id = state.upstream.create_session().await?;
    info!(%client, %session_id, "Session created");
    Ok((
        StatusCode::OK,
        [(SESSION_HEADER, session_id.clone())],
        Json(json!({ "session_id": session_id })),
    )
        .into_response())
}

/// Relay one message upstream and pipe the event stream back.
async fn relay_message(
    State(state): State<Arc<AppState>>,
    ClientIp(client): ClientIp,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ProxyError> {
    state.check_quota(&client)?;
    state.upstream.require_credentials(true)?;

    let Json(body) = body.map_err(|rejection| ProxyError::Validation(rejection.body_text()))?;
    let message = validate_message(&body, state.config.max_message_chars)?;

    let session_id = match body.get("session_id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => state.upstream.create_session().await?,
    };

    let upstream = state.upstream.send_message(&session_id, message).await?;
    debug!(%client, %session_id, status = %upstream.status(), "Streaming upstream reply");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(SESSION_HEADER, session_id)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ProxyError::Internal(err.to_string()))
}

fn validate_message(body: &Value, max_chars: usize) -> Result<&str, ProxyError> {
    let message = body
        .get("message")
        .filter(|m| truthy(m))
        .ok_or_else(|| ProxyError::Validation("Message is required".to_string()))?;

    match message.as_str() {
        Some(text) if text.chars().count() <= max_chars => Ok(text),
        _ => Err(ProxyError::Validation(format!(
            "Message must be a string and cannot exceed {max_chars} characters"
        ))),
    }
}
