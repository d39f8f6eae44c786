//! Classification of in-band error payloads.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

const RATE_LIMITED: &str = "Rate limit exceeded. The AI service is currently receiving too many requests. Please wait a moment and try again.";
const UNAVAILABLE: &str = "The AI service is temporarily unavailable. Please try again in a few moments.";
const INTERNAL: &str = "The AI service encountered an internal error. Please try again.";
const UNAUTHORIZED: &str = "Authentication error. Please refresh the page and try again.";
const UNEXPECTED: &str = "An unexpected error occurred. Please try again.";

/// Kind of failure reported inside an event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Upstream quota or rate limit hit.
    RateLimited,
    /// Upstream temporarily unavailable.
    Unavailable,
    /// Upstream internal failure.
    Internal,
    /// Upstream rejected our credentials.
    Unauthorized,
    /// Anything else, carrying the cleaned upstream message.
    Other(String),
}

impl ErrorClass {
    /// Message suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::RateLimited => RATE_LIMITED,
            Self::Unavailable => UNAVAILABLE,
            Self::Internal => INTERNAL,
            Self::Unauthorized => UNAUTHORIZED,
            Self::Other(message) => message,
        }
    }

    /// Whether this is a rate-limit condition.
    #[must_use]
    pub const fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.user_message())
    }
}

/// Classify an `error` payload, which may be a bare string or an object with
/// `code` / `status` / `message` fields.
#[must_use]
pub fn classify(error: &Value) -> ErrorClass {
    let (code, message) = match error {
        Value::String(message) => (None, message.clone()),
        Value::Object(fields) => {
            let code = fields
                .get("code")
                .filter(|c| super::extract::truthy(c))
                .or_else(|| fields.get("status"));
            let message = match fields.get("message") {
                Some(Value::String(m)) if !m.is_empty() => m.clone(),
                _ => error.to_string(),
            };
            (code.cloned(), message)
        }
        other => (None, other.to_string()),
    };

    let code_number = code.as_ref().and_then(Value::as_i64);
    let code_text = code.as_ref().and_then(Value::as_str).unwrap_or_default();
    let mentions = |needle: &str| message.contains(needle) || code_text.contains(needle);

    if code_number == Some(429) || mentions("429") || mentions("RESOURCE_EXHAUSTED") {
        return ErrorClass::RateLimited;
    }
    if code_number == Some(503) || mentions("503") || mentions("SERVICE_UNAVAILABLE") {
        return ErrorClass::Unavailable;
    }
    if code_number == Some(500) || mentions("500") || mentions("INTERNAL") {
        return ErrorClass::Internal;
    }
    if matches!(code_number, Some(401 | 403)) || mentions("UNAUTHENTICATED") || mentions("PERMISSION_DENIED") {
        return ErrorClass::Unauthorized;
    }

    let cleaned = sanitize(&message);
    if cleaned.is_empty() {
        ErrorClass::Other(UNEXPECTED.to_string())
    } else {
        ErrorClass::Other(cleaned)
    }
}

/// Strips documentation links and inline JSON fragments from upstream messages.
struct MessageSanitizer {
    refer_link: Regex,
    braces: Regex,
}

impl MessageSanitizer {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            refer_link: Regex::new(r"(?i)Please refer to https?://\S+")?,
            braces: Regex::new(r"\{[^}]*\}")?,
        })
    }

    fn clean(&self, message: &str) -> String {
        let without_links = self.refer_link.replace_all(message, "");
        self.braces.replace_all(&without_links, "").trim().to_string()
    }
}

fn sanitize(message: &str) -> String {
    static SANITIZER: OnceLock<Option<MessageSanitizer>> = OnceLock::new();
    let sanitizer = SANITIZER.get_or_init(|| {
        MessageSanitizer::new()
            .map_err(|err| warn!(%err, "Failed to compile error sanitizer"))
            .ok()
    });
    match sanitizer {
        Some(s) => s.clean(message),
        None => message.trim().to_string(),
    }
}
