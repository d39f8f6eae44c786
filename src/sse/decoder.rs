//! Incremental event-stream decoder.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, trace};

use super::classify::ErrorClass;
use super::extract::{FrameOutcome, interpret};
use super::frame::{FrameBuffer, frame_data};
use super::utf8::Utf8StreamDecoder;

/// Errors that abort stream decoding.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream carried an in-band error frame.
    #[error("{0}")]
    Upstream(ErrorClass),
    /// Reading the underlying byte stream failed.
    #[error("stream read failed: {0}")]
    Read(String),
}

impl StreamError {
    /// The classified in-band error, if that is what stopped the stream.
    #[must_use]
    pub const fn class(&self) -> Option<&ErrorClass> {
        match self {
            Self::Upstream(class) => Some(class),
            Self::Read(_) => None,
        }
    }
}

/// Push-based decoder turning raw chunks into text deltas.
///
/// Frames split across chunks are held until their terminating blank line
/// arrives, so the deltas produced do not depend on how the bytes were chunked.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8StreamDecoder,
    frames: FrameBuffer,
}

impl SseDecoder {
    /// Create a decoder with empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, forwarding every delta from the frames it completes.
    ///
    /// # Errors
    /// Returns the first in-band error; deltas before it have already been forwarded.
    pub fn push<F: FnMut(String)>(&mut self, chunk: &[u8], on_text: &mut F) -> Result<(), StreamError> {
        let text = self.utf8.decode(chunk);
        for frame in self.frames.push(&text) {
            process_frame(&frame, on_text)?;
        }
        Ok(())
    }

    /// Flush the decoder at end of stream, processing any unterminated tail once.
    ///
    /// # Errors
    /// Returns an in-band error found in the tail.
    pub fn finish<F: FnMut(String)>(mut self, on_text: &mut F) -> Result<(), StreamError> {
        let tail = self.utf8.finish();
        for frame in self.frames.push(&tail) {
            process_frame(&frame, on_text)?;
        }
        if let Some(rest) = self.frames.take_remainder() {
            debug!(bytes = rest.len(), "Processing unterminated trailing frame");
            process_frame(&rest, on_text)?;
        }
        Ok(())
    }
}

fn process_frame<F: FnMut(String)>(frame: &str, on_text: &mut F) -> Result<(), StreamError> {
    let Some(data) = frame_data(frame) else {
        return Ok(());
    };
    match interpret(&data) {
        FrameOutcome::Text(delta) => on_text(delta),
        FrameOutcome::ToolMarker => trace!("Skipping tool marker frame"),
        FrameOutcome::Error(class) => return Err(StreamError::Upstream(class)),
    }
    Ok(())
}

/// Decode a byte stream to completion, forwarding each text delta.
///
/// The stream is consumed and dropped on every exit path, releasing the
/// underlying body.
///
/// # Errors
/// Returns the in-band or read error that stopped decoding.
pub async fn consume_sse_stream<S, B, E, F>(stream: S, mut on_text: F) -> Result<(), StreamError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(String),
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| StreamError::Read(err.to_string()))?;
        decoder.push(chunk.as_ref(), &mut on_text)?;
    }
    decoder.finish(&mut on_text)
}

/// Like [`consume_sse_stream`], but hands any error to `on_error` and completes
/// normally instead of returning it.
pub async fn consume_sse_stream_with<S, B, E, F, H>(stream: S, on_text: F, on_error: H)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(String),
    H: FnOnce(StreamError),
{
    if let Err(err) = consume_sse_stream(stream, on_text).await {
        on_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const SAMPLE: &str = concat!(
        "data: {\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}\n\n",
        "data: {\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"lookup\"}}]}}\n\n",
        "data: {\"text\":\"lo \"}\n\n",
        "data: plain words\n\n",
        "data: \"caf\u{e9} \u{2713}\"\n\n",
        "data: {\"message\":\"!\"}"
    );

    async fn decode_chunks(chunks: Vec<Vec<u8>>) -> (Vec<String>, Result<(), StreamError>) {
        let mut deltas = Vec::new();
        let source = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        let result = consume_sse_stream(source, |d| deltas.push(d)).await;
        (deltas, result)
    }

    fn expected() -> Vec<String> {
        vec![
            "Hel".to_string(),
            "lo ".to_string(),
            "plain words".to_string(),
            "caf\u{e9} \u{2713}".to_string(),
            "!".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_single_read() {
        let (deltas, result) = decode_chunks(vec![SAMPLE.as_bytes().to_vec()]).await;
        result.unwrap();
        assert_eq!(deltas, expected());
    }

    #[tokio::test]
    async fn test_chunking_does_not_change_deltas() {
        let bytes = SAMPLE.as_bytes();
        for size in [1, 2, 3, 5, 7, 16, 64] {
            let chunks = bytes.chunks(size).map(<[u8]>::to_vec).collect();
            let (deltas, result) = decode_chunks(chunks).await;
            result.unwrap();
            assert_eq!(deltas, expected(), "chunk size {size}");
        }
    }

    #[test]
    fn test_partial_frame_waits_for_delimiter() {
        let mut decoder = SseDecoder::new();
        let mut deltas = Vec::new();
        let mut sink = |d: String| deltas.push(d);

        decoder.push(b"data: {\"text\":\"wa", &mut sink).unwrap();
        decoder.push(b"it\"}\n", &mut sink).unwrap();
        decoder.push(b"\n", &mut sink).unwrap();
        decoder.finish(&mut sink).unwrap();

        assert_eq!(deltas, vec!["wait".to_string()]);
    }

    #[test]
    fn test_partial_frame_not_parsed_before_end() {
        let mut decoder = SseDecoder::new();
        let mut count = 0;
        let mut sink = |_d: String| count += 1;
        decoder.push(b"data: {\"text\":\"x\"}", &mut sink).unwrap();
        decoder.push(b"\n", &mut sink).unwrap();
        drop(sink);
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_error_frame_halts_emission() {
        let body = "data: {\"text\":\"a\"}\n\ndata: {\"error\":{\"code\":429}}\n\ndata: {\"text\":\"b\"}\n\n";
        let (deltas, result) = decode_chunks(vec![body.as_bytes().to_vec()]).await;

        assert_eq!(deltas, vec!["a".to_string()]);
        let err = result.unwrap_err();
        assert!(err.class().is_some_and(ErrorClass::is_rate_limit));
        assert!(err.to_string().starts_with("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_error_in_trailing_frame() {
        let body = "data: {\"text\":\"a\"}\n\ndata: {\"error\":\"SERVICE_UNAVAILABLE\"}";
        let (deltas, result) = decode_chunks(vec![body.as_bytes().to_vec()]).await;
        assert_eq!(deltas, vec!["a".to_string()]);
        assert_eq!(result.unwrap_err().class(), Some(&ErrorClass::Unavailable));
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let source = stream::iter(vec![
            Ok(b"data: {\"text\":\"a\"}\n\n".to_vec()),
            Err(std::io::Error::other("connection reset")),
        ]);
        let mut deltas = Vec::new();
        let result = consume_sse_stream(source, |d| deltas.push(d)).await;

        assert_eq!(deltas, vec!["a".to_string()]);
        assert!(matches!(result, Err(StreamError::Read(msg)) if msg.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_error_handler_receives_error() {
        let source = stream::iter(vec![Ok::<_, std::io::Error>(
            b"data: {\"error\":{\"code\":500}}\n\n".to_vec(),
        )]);
        let mut seen = None;
        consume_sse_stream_with(source, |_| {}, |err| seen = Some(err)).await;
        assert_eq!(seen.and_then(|e| e.class().cloned()), Some(ErrorClass::Internal));
    }
}
