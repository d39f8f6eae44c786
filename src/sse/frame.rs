//! Frame splitting for `data:`-only event streams.

/// Blank line separating two frames.
pub const FRAME_DELIMITER: &str = "\n\n";

/// Prefix of a data line, including the single space.
pub const DATA_PREFIX: &str = "data: ";

/// Accumulates decoded text and hands out complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: String,
}

impl FrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and drain every frame terminated by a blank line.
    ///
    /// The unterminated tail stays buffered.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find(FRAME_DELIMITER) {
            let frame: String = self.buffer.drain(..pos).collect();
            self.buffer.drain(..FRAME_DELIMITER.len());
            frames.push(frame);
        }
        frames
    }

    /// Take the unterminated tail at end of stream, if it holds anything.
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }

    /// Text buffered but not yet part of a complete frame.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Concatenate the payload of every `data: ` line in a frame.
///
/// Returns `None` when the frame carries no data.
#[must_use]
pub fn frame_data(frame: &str) -> Option<String> {
    if frame.trim().is_empty() {
        return None;
    }
    let data: String = frame
        .split('\n')
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .collect();
    if data.is_empty() { None } else { Some(data) }
}
