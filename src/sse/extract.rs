//! Text extraction from loosely shaped frame payloads.
//!
//! Upstream payloads are not contractually specified, so extraction walks an
//! ordered list of accessors and the first one that matches wins. A payload no
//! accessor recognizes is forwarded as its JSON text.

use serde_json::Value;
use tracing::trace;

use super::classify::{ErrorClass, classify};

/// What a single frame contributes to the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A text delta to forward.
    Text(String),
    /// Tool-use metadata, contributes no visible text.
    ToolMarker,
    /// An in-band error that aborts the stream.
    Error(ErrorClass),
}

type Extractor = fn(&Value) -> Option<String>;

/// Accessors tried in order; first match wins.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("string", bare_string),
    ("text", text_field),
    ("content.parts[0].text", first_part_text),
    ("content", content_string),
    ("message", message_field),
];

/// Interpret the concatenated data of one frame.
#[must_use]
pub fn interpret(data: &str) -> FrameOutcome {
    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        return FrameOutcome::Text(data.to_string());
    };

    if let Some(error) = payload.get("error").filter(|e| truthy(e)) {
        return FrameOutcome::Error(classify(error));
    }
    if is_tool_marker(&payload) {
        return FrameOutcome::ToolMarker;
    }
    FrameOutcome::Text(extract_text(&payload))
}

/// Pull the visible text out of a decoded payload.
#[must_use]
pub fn extract_text(payload: &Value) -> String {
    for (name, extractor) in EXTRACTORS {
        if let Some(text) = extractor(payload) {
            trace!(extractor = name, "Extracted text delta");
            return text;
        }
    }
    payload.to_string()
}

/// JavaScript-style truthiness of a JSON value.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn first_part(payload: &Value) -> Option<&Value> {
    payload.get("content")?.get("parts")?.get(0)
}

fn is_tool_marker(payload: &Value) -> bool {
    first_part(payload).is_some_and(|part| {
        part.get("functionCall").is_some_and(truthy) || part.get("functionResponse").is_some_and(truthy)
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bare_string(payload: &Value) -> Option<String> {
    payload.as_str().map(str::to_string)
}

fn text_field(payload: &Value) -> Option<String> {
    payload.get("text").filter(|v| truthy(v)).map(render)
}

fn first_part_text(payload: &Value) -> Option<String> {
    first_part(payload)?.get("text").filter(|v| truthy(v)).map(render)
}

fn content_string(payload: &Value) -> Option<String> {
    payload
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn message_field(payload: &Value) -> Option<String> {
    payload.get("message").filter(|v| truthy(v)).map(render)
}
