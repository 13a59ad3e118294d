//! Splitting a streamed body into event frames

use async_stream::stream;
use bytes::BytesMut;
use futures::{Stream, StreamExt};

/// Payload that marks the end of the stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// One transport-delivered unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data payload, with the event name announced before it (if any)
    Data { event: Option<String>, data: String },
    /// The `[DONE]` terminal frame
    Done,
}

impl Frame {
    /// Get the payload if this is a data frame
    pub fn data(&self) -> Option<&str> {
        match self {
            Frame::Data { data, .. } => Some(data),
            Frame::Done => None,
        }
    }

    /// Check if this is the terminal frame
    pub fn is_done(&self) -> bool {
        matches!(self, Frame::Done)
    }
}

/// Incremental line lexer for event-stream bodies.
///
/// Bytes are buffered until a `\n` is seen, so a line (or a multi-byte
/// character) split across reads is only lexed once it is complete.
#[derive(Debug, Default)]
pub struct FrameLexer {
    buffer: BytesMut,
    event: Option<String>,
}

impl FrameLexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let raw = String::from_utf8_lossy(&line[..pos]);
            let text = raw.strip_suffix('\r').unwrap_or(&raw);
            if let Some(frame) = self.lex_line(text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Number of buffered bytes still waiting for a line terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Signal end of input. An unterminated remainder is never a frame and
    /// is dropped here.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                bytes = self.buffer.len(),
                "Discarding unterminated trailing line at end of stream"
            );
            self.buffer.clear();
        }
        self.event = None;
    }

    fn lex_line(&mut self, line: &str) -> Option<Frame> {
        if line.trim().is_empty() {
            // Blank line ends the current event
            self.event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) if matches!(field, "data" | "event" | "id" | "retry") => {
                (field, value.strip_prefix(' ').unwrap_or(value))
            }
            // No field prefix: a bare payload line
            _ => ("data", line),
        };

        match field {
            "event" => {
                let name = value.trim();
                self.event = (!name.is_empty()).then(|| name.to_string());
                None
            }
            "data" => {
                let payload = value.trim();
                if payload.is_empty() {
                    return None;
                }
                if payload == DONE_SENTINEL {
                    self.event = None;
                    return Some(Frame::Done);
                }
                Some(Frame::Data {
                    event: self.event.take(),
                    data: value.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Adapt a stream of byte chunks into a stream of frames.
///
/// The first chunk error is forwarded and ends the frame stream.
pub fn frames<S, B, E>(chunks: S) -> impl Stream<Item = Result<Frame, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream! {
        let mut chunks = Box::pin(chunks);
        let mut lexer = FrameLexer::new();

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in lexer.push(bytes.as_ref()) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        lexer.finish();
    }
}
