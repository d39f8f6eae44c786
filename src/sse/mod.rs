//! Server-Sent-Events decoding for agent replies.
//!
//! Bytes are decoded as UTF-8 across chunk boundaries, split into blank-line
//! delimited frames, and each frame's `data: ` lines are interpreted as a text
//! delta, a tool marker to skip, or an in-band error that aborts the stream.

pub mod classify;
pub mod decoder;
pub mod extract;
pub mod frame;
pub mod utf8;

pub use classify::{ErrorClass, classify};
pub use decoder::{SseDecoder, StreamError, consume_sse_stream, consume_sse_stream_with};
pub use extract::{FrameOutcome, extract_text, interpret};
pub use frame::FrameBuffer;
pub use utf8::Utf8StreamDecoder;
