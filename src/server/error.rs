//! Proxy failures and their HTTP rendering.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use super::ratelimit::QuotaDecision;

/// Message returned whenever a rate limit is hit, ours or the upstream's.
pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please wait a moment and try again.";

/// Errors returned by the proxy handlers, rendered as `{"error": ...}`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client spent its quota.
    #[error("Rate limit exceeded. Please wait a moment and try again.")]
    QuotaExceeded(QuotaDecision),

    /// Upstream endpoints or token are not configured.
    #[error("Server configuration error: Missing API credentials")]
    MissingCredentials,

    /// The request body was rejected before any upstream call.
    #[error("{0}")]
    Validation(String),

    /// The upstream no longer knows the session.
    #[error("Your session has expired. Please try again.")]
    SessionExpired,

    /// The upstream reported a rate limit.
    #[error("Rate limit exceeded. Please wait a moment and try again.")]
    UpstreamRateLimited,

    /// The upstream failed for another reason.
    #[error("{0}")]
    Upstream(String),

    /// No session id could be extracted from the upstream reply.
    #[error("Failed to establish session")]
    NoSession,

    /// The upstream could not be reached. The cause is logged, never returned.
    #[error("Failed to reach the AI service")]
    Http(#[from] reqwest::Error),

    /// Building the response failed.
    #[error("Internal server error")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded(_) | Self::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionExpired => StatusCode::NOT_FOUND,
            Self::MissingCredentials | Self::Upstream(_) | Self::NoSession | Self::Http(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Internal(detail) => error!(%detail, "Proxy internal error"),
            Self::Http(err) => error!(%err, "Upstream request failed"),
            _ if status.is_server_error() => error!(error = %self, "Proxy request failed"),
            _ => warn!(error = %self, %status, "Proxy request rejected"),
        }

        let body = Json(json!({ "error": self.to_string() }));
        match self {
            Self::QuotaExceeded(decision) => (
                status,
                [
                    ("X-RateLimit-Limit", decision.limit.to_string()),
                    ("X-RateLimit-Remaining", decision.remaining.to_string()),
                    ("X-RateLimit-Reset", decision.reset_rfc3339()),
                ],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}
