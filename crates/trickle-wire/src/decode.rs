//! Payload decoding: one frame's data payload to zero or more text deltas.
//!
//! Services disagree on what a frame carries, so a payload is matched against
//! a fixed list of grammars in priority order and the first match wins:
//!
//! 1. [`Grammar::DirectText`]: a JSON object with a string `text` field
//! 2. [`Grammar::ChatCompletion`]: `{"choices":[{"delta":{"content":..}}]}` or
//!    `{"choices":[{"text":..}]}`
//! 3. [`Grammar::ByteLiteral`]: a `b'...'` / `b"..."` literal with `\xHH` escapes
//! 4. [`Grammar::JsonPatch`]: `{"ops":[{"op":"add","path":".../streamed_output/-","value":..}]}`
//! 5. [`Grammar::TextField`]: a `"text":"..."` field found by pattern in
//!    otherwise unparseable input
//!
//! A payload that matches nothing is dropped; one bad frame never ends a stream.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::escape::{strip_byte_literal, unescape_byte_literal, unescape_named};
use crate::frame::DONE_SENTINEL;

/// End-of-sequence control token emitted by some model servers
pub const END_OF_SEQUENCE: &str = "</s>";

/// Path suffix of JSON-patch ops that append streamed output
const STREAMED_OUTPUT_SUFFIX: &str = "/streamed_output/-";

static TEXT_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""text"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

/// A decoded unit of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Text to append to the running result
    Text(String),
    /// The stream is over
    Done,
}

impl Delta {
    /// Get the text if this is a text delta
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Delta::Text(text) => Some(text),
            Delta::Done => None,
        }
    }
}

/// Accepted payload grammars, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    DirectText,
    ChatCompletion,
    ByteLiteral,
    JsonPatch,
    TextField,
}

/// A payload after classification, carrying what its grammar extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    /// The terminal `[DONE]` sentinel
    Done,
    DirectText(String),
    ChatCompletion(Vec<String>),
    /// Inner content of the literal, still escaped
    ByteLiteral(&'a str),
    JsonPatch(Vec<String>),
    /// Captured field value, still escaped
    TextField(&'a str),
}

impl Payload<'_> {
    /// The grammar that matched, or `None` for the terminal sentinel
    pub fn grammar(&self) -> Option<Grammar> {
        match self {
            Payload::Done => None,
            Payload::DirectText(_) => Some(Grammar::DirectText),
            Payload::ChatCompletion(_) => Some(Grammar::ChatCompletion),
            Payload::ByteLiteral(_) => Some(Grammar::ByteLiteral),
            Payload::JsonPatch(_) => Some(Grammar::JsonPatch),
            Payload::TextField(_) => Some(Grammar::TextField),
        }
    }

    /// Turn the extracted values into deltas. Empty strings and the
    /// end-of-sequence token never produce a delta.
    pub fn into_deltas(self) -> Vec<Delta> {
        let texts = match self {
            Payload::Done => return vec![Delta::Done],
            Payload::DirectText(text) => vec![text],
            Payload::ChatCompletion(texts) | Payload::JsonPatch(texts) => texts,
            Payload::ByteLiteral(body) if body == END_OF_SEQUENCE => vec![],
            Payload::ByteLiteral(body) => vec![unescape_byte_literal(body)],
            Payload::TextField(raw) => vec![unescape_named(raw)],
        };

        texts
            .into_iter()
            .filter(|text| !text.is_empty())
            .map(Delta::Text)
            .collect()
    }
}

/// Classify a payload against the accepted grammars.
///
/// Returns `None` when the payload is blank or matches no grammar.
pub fn classify(payload: &str) -> Option<Payload<'_>> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(Payload::Done);
    }

    let json = serde_json::from_str::<Value>(payload).ok();

    if let Some(value) = &json {
        if let Some(text) = value.get("text").and_then(Value::as_str) {
            return Some(Payload::DirectText(text.to_string()));
        }
        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            return Some(Payload::ChatCompletion(choice_texts(choices)));
        }
    }

    if let Some(body) = strip_byte_literal(payload) {
        return Some(Payload::ByteLiteral(body));
    }

    if let Some(ops) = json
        .as_ref()
        .and_then(|v| v.get("ops"))
        .and_then(Value::as_array)
    {
        return Some(Payload::JsonPatch(streamed_values(ops)));
    }

    TEXT_FIELD
        .captures(payload)
        .and_then(|caps| caps.get(1))
        .map(|m| Payload::TextField(m.as_str()))
}

/// Decode one frame payload into deltas, in order.
///
/// Pure: never fails. Unrecognised payloads yield nothing.
pub fn decode_payload(payload: &str) -> Vec<Delta> {
    match classify(payload) {
        Some(classified) => classified.into_deltas(),
        None => {
            if !payload.trim().is_empty() {
                tracing::trace!(
                    payload = %truncate(payload, 120),
                    "Dropping frame that matches no payload grammar"
                );
            }
            Vec::new()
        }
    }
}

/// Token-delta (`delta.content`) or full-text (`text`) per choice
fn choice_texts(choices: &[Value]) -> Vec<String> {
    choices
        .iter()
        .filter_map(|choice| {
            choice
                .pointer("/delta/content")
                .and_then(Value::as_str)
                .or_else(|| choice.get("text").and_then(Value::as_str))
        })
        .map(str::to_string)
        .collect()
}

/// Values of `add` ops that append to a nested `streamed_output` list
fn streamed_values(ops: &[Value]) -> Vec<String> {
    ops.iter()
        .filter(|op| op.get("op").and_then(Value::as_str) == Some("add"))
        .filter(|op| {
            op.get("path")
                .and_then(Value::as_str)
                .is_some_and(|path| {
                    path.len() > STREAMED_OUTPUT_SUFFIX.len()
                        && path.ends_with(STREAMED_OUTPUT_SUFFIX)
                })
        })
        .filter_map(|op| match op.get("value")? {
            Value::String(text) => Some(text.clone()),
            // Message-chunk objects carry their text in `content`
            Value::Object(chunk) => chunk
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .filter(|text| text != END_OF_SEQUENCE)
        .collect()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
