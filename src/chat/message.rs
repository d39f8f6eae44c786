//! Conversation data shown to observers.

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The person chatting.
    User,
    /// The agent.
    Ai,
}

/// One transcript entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Process-local id; assignment order is conversation order.
    pub id: u64,
    /// Message text. Grows while an AI reply streams.
    pub text: String,
    /// Author.
    pub sender: Sender,
    /// Display time, e.g. `3:07 PM`.
    pub timestamp: String,
    /// The reply is still receiving deltas.
    pub streaming: bool,
    /// Apology placeholder appended after a failure.
    pub is_error: bool,
}

impl ChatMessage {
    /// A finished user message.
    #[must_use]
    pub fn user(id: u64, text: impl Into<String>) -> Self {
        Self::build(id, text.into(), Sender::User, false, false)
    }

    /// An AI reply that is still streaming.
    #[must_use]
    pub fn ai_streaming(id: u64, text: impl Into<String>) -> Self {
        Self::build(id, text.into(), Sender::Ai, true, false)
    }

    /// The apology shown after a failed exchange.
    #[must_use]
    pub fn ai_error(id: u64, text: impl Into<String>) -> Self {
        Self::build(id, text.into(), Sender::Ai, false, true)
    }

    fn build(id: u64, text: String, sender: Sender, streaming: bool, is_error: bool) -> Self {
        Self {
            id,
            text,
            sender,
            timestamp: Local::now().format("%-I:%M %p").to_string(),
            streaming,
            is_error,
        }
    }
}

/// Failure surfaced to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatbotError {
    /// Human-readable description.
    pub message: String,
    /// Whether offering a retry makes sense.
    pub can_retry: bool,
}

/// Snapshot published to observers after every change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatState {
    /// Transcript in conversation order.
    pub messages: Vec<ChatMessage>,
    /// A send cycle is in flight.
    pub is_loading: bool,
    /// The first delta of the current reply has arrived.
    pub is_streaming: bool,
    /// Last failure, cleared by the next send.
    pub error: Option<ChatbotError>,
    /// Session id as last seen by this client.
    pub session_id: Option<String>,
}

impl ChatState {
    /// Text of the most recent user message.
    #[must_use]
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.sender == Sender::User)
            .map(|m| m.text.as_str())
    }
}
