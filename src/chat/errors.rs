//! Error types for the chat client.

use thiserror::Error;

use crate::session::SessionError;
use crate::sse::StreamError;

/// Errors raised while exchanging messages with the proxy.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The user cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The proxy could not be reached or the connection broke.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The proxy base URL is not usable.
    #[error("invalid proxy URL: {0}")]
    Url(#[from] url::ParseError),

    /// The proxy answered with a non-success status.
    #[error("{message}")]
    Api {
        /// HTTP status returned by the proxy.
        status: u16,
        /// Message taken from the `{error}` body, or a generic one.
        message: String,
    },

    /// The reply stream failed or carried an in-band error.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Session storage failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Whether this is a user cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Message shown to the user for this failure.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Http(_) => "Could not reach the chat service. Please try again.".to_string(),
            other => other.to_string(),
        }
    }
}
