//! Incremental decoder for `data: ...` event streams.
//!
//! Chat-completion endpoints stream one JSON object per `data: ` line and end
//! with `data: [DONE]`. The decoder accepts raw body chunks in any split,
//! reassembles lines, and appends the text found at a JSON pointer.
//!
//! Malformed chunks are governed by [`ChunkPolicy`]. Streaming callers use
//! [`ChunkPolicy::Skip`]: partial content beats none for long generations.
//! Whole-body responses are decoded elsewhere and fail hard instead.

use crate::http::BodyStream;
use crate::retry::InvokeError;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, trace};

/// Prefix of every relevant line.
pub const DATA_PREFIX: &str = "data: ";

/// Payload that terminates the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Location of the incremental text in an OpenAI-style chunk.
pub const CHAT_DELTA_POINTER: &str = "/choices/0/delta/content";

/// Location of the correlation id in an OpenAI-style chunk.
pub const CHAT_ID_POINTER: &str = "/id";

/// What to do with a `data:` line whose payload is not valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkPolicy {
    /// Count it and keep decoding.
    #[default]
    Skip,
    /// Abort with [`InvokeError::Decode`].
    Fail,
}

/// Effect of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not a `data: ` line, or arrived after the sentinel.
    Ignored,
    /// Text was appended.
    Appended,
    /// Valid JSON without text at the pointer (role-only deltas, usage).
    NoContent,
    /// Malformed payload skipped under [`ChunkPolicy::Skip`].
    Skipped,
    /// The `[DONE]` sentinel.
    Done,
}

/// Final state of a decoded stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Concatenated text
    pub text: String,
    /// First non-empty correlation id seen
    pub id: Option<String>,
    /// Malformed chunks skipped
    pub skipped: usize,
    /// Whether the `[DONE]` sentinel was seen
    pub terminated: bool,
}

/// Line-oriented streaming decoder.
#[derive(Debug, Clone)]
pub struct SseDecoder {
    text_pointer: String,
    id_pointer: String,
    policy: ChunkPolicy,
    pending: Vec<u8>,
    state: Decoded,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Decoder for OpenAI-style chat deltas.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pointers(CHAT_DELTA_POINTER, CHAT_ID_POINTER)
    }

    /// Decoder reading text and id from custom JSON pointers.
    #[must_use]
    pub fn with_pointers(text_pointer: impl Into<String>, id_pointer: impl Into<String>) -> Self {
        Self {
            text_pointer: text_pointer.into(),
            id_pointer: id_pointer.into(),
            policy: ChunkPolicy::Skip,
            pending: Vec::new(),
            state: Decoded::default(),
        }
    }

    /// Sets the malformed-chunk policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns true once the sentinel has been seen.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.state.terminated
    }

    /// Text accumulated so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.state.text
    }

    /// Feeds a raw body chunk. Incomplete trailing lines are buffered.
    ///
    /// # Errors
    ///
    /// Returns a decode error for a malformed chunk under [`ChunkPolicy::Fail`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), InvokeError> {
        if self.is_done() {
            return Ok(());
        }
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = memchr::memchr(b'\n', &self.pending[start..]) {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]).into_owned();
            start = end + 1;
            if self.push_line(&line)? == LineOutcome::Done {
                break;
            }
        }
        self.pending.drain(..start);
        Ok(())
    }

    /// Processes one complete line (without its newline).
    ///
    /// # Errors
    ///
    /// Returns a decode error for a malformed chunk under [`ChunkPolicy::Fail`].
    pub fn push_line(&mut self, line: &str) -> Result<LineOutcome, InvokeError> {
        if self.is_done() {
            return Ok(LineOutcome::Ignored);
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return Ok(LineOutcome::Ignored);
        };
        if payload == DONE_SENTINEL {
            self.state.terminated = true;
            return Ok(LineOutcome::Done);
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                return match self.policy {
                    ChunkPolicy::Skip => {
                        self.state.skipped += 1;
                        debug!(error = %e, "Skipping malformed stream chunk");
                        Ok(LineOutcome::Skipped)
                    }
                    ChunkPolicy::Fail => Err(InvokeError::decode(format!(
                        "malformed stream chunk: {e}"
                    ))),
                };
            }
        };

        if self.state.id.is_none() {
            if let Some(id) = value
                .pointer(&self.id_pointer)
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
            {
                self.state.id = Some(id.to_string());
            }
        }

        match value.pointer(&self.text_pointer).and_then(Value::as_str) {
            Some(text) => {
                trace!(len = text.len(), "Appending stream chunk");
                self.state.text.push_str(text);
                Ok(LineOutcome::Appended)
            }
            None => Ok(LineOutcome::NoContent),
        }
    }

    /// Flushes a trailing line without newline and returns the result.
    ///
    /// # Errors
    ///
    /// Returns a decode error for a malformed chunk under [`ChunkPolicy::Fail`].
    pub fn finish(mut self) -> Result<Decoded, InvokeError> {
        if !self.pending.is_empty() && !self.is_done() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.push_line(&line)?;
        }
        Ok(self.state)
    }
}

/// Decodes a complete sequence of lines.
///
/// # Errors
///
/// Returns a decode error for a malformed chunk under [`ChunkPolicy::Fail`].
pub fn decode_lines<'a>(
    mut decoder: SseDecoder,
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<Decoded, InvokeError> {
    for line in lines {
        if decoder.push_line(line)? == LineOutcome::Done {
            break;
        }
    }
    decoder.finish()
}

/// Reads `body` until the sentinel or end of stream.
///
/// # Errors
///
/// Returns the transport error raised while reading, or a decode error under
/// [`ChunkPolicy::Fail`].
pub async fn decode_stream(mut body: BodyStream, mut decoder: SseDecoder) -> Result<Decoded, InvokeError> {
    while let Some(chunk) = body.next().await {
        decoder.feed(&chunk?)?;
        if decoder.is_done() {
            break;
        }
    }
    decoder.finish()
}
