//! Chat client.
//!
//! [`Chatbot`] owns the transcript and drives each send cycle: it appends the
//! user message, relays it through a [`ChatTransport`], adopts the session id
//! the proxy reports, and folds streamed deltas into a single AI message.

pub mod errors;
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use errors::{ChatError, ChatResult};
pub use message::{ChatMessage, ChatState, ChatbotError, Sender};
pub use orchestrator::{APOLOGY, Chatbot, WARMUP_MESSAGE};
pub use session::{ChatSession, SESSION_KEY, SESSION_TTL};
pub use transport::{ChatRequest, ChatTransport, HttpTransport, ProxyReply, ReplyBody, SessionCreated};
