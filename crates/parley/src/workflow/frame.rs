//! Upstream frame decoding and per-turn accumulation.
//!
//! The workflow engine streams SSE data payloads whose shape has drifted
//! over time: newer servers wrap everything in a `data` envelope carrying
//! `event`/`status`, older ones emit flat frames with half a dozen possible
//! text fields. The accumulator normalizes both into one growing assistant
//! text plus the continuation identifiers needed to resume the workflow.

use log::{debug, warn};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::store::ContinuationState;

static SESSION_ID_SALVAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""session(?:_id|Id)"\s*:\s*"([^"]+)""#).unwrap()
});

/// What the caller should do after feeding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Accumulated text changed; emit the current content to listeners.
    Updated,
    /// Frame consumed without a visible content change.
    Ignored,
    /// The upstream is waiting for input: re-invoke with the continuation
    /// identifiers. Returned at most once per turn.
    Continue,
    /// Upstream signaled completion.
    Done,
}

/// Accumulates one assistant turn from a stream of upstream frames.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    content: String,
    continuation: ContinuationState,
    continuation_requested: bool,
    saw_content: bool,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The assistant text accumulated so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Continuation identifiers observed so far.
    pub fn continuation(&self) -> &ContinuationState {
        &self.continuation
    }

    /// Whether any frame contributed visible content.
    pub fn saw_content(&self) -> bool {
        self.saw_content
    }

    /// Feed one raw SSE data payload.
    pub fn apply_raw(&mut self, data: &str) -> FrameOutcome {
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return if trimmed == "[DONE]" {
                FrameOutcome::Done
            } else {
                FrameOutcome::Ignored
            };
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => self.apply_value(&value),
            Err(e) => {
                warn!("Unparseable upstream frame ({}), salvaging", e);
                // A malformed frame may still carry the session id we need
                // to resume the workflow later.
                if let Some(captures) = SESSION_ID_SALVAGE.captures(trimmed) {
                    self.record_session_id(captures[1].to_string());
                }
                self.append(trimmed);
                FrameOutcome::Updated
            }
        }
    }

    /// Feed one decoded frame.
    pub fn apply_value(&mut self, value: &Value) -> FrameOutcome {
        self.record_ids(value);

        // Nested status frame takes priority over the flat legacy shape.
        if let Some(data) = value.get("data").filter(|d| d.is_object()) {
            self.record_ids(data);
            return self.apply_envelope(data);
        }

        self.apply_flat(value)
    }

    fn apply_envelope(&mut self, data: &Value) -> FrameOutcome {
        let event = data.get("event").and_then(Value::as_str).unwrap_or("");
        let status = data.get("status").and_then(Value::as_str).unwrap_or("");

        match event {
            "input" => return self.request_continuation(),
            "close" | "end" => return FrameOutcome::Done,
            "error" => {
                if let Some(message) = data.get("message").and_then(Value::as_str) {
                    self.append(message);
                    return FrameOutcome::Updated;
                }
                return FrameOutcome::Done;
            }
            _ => {}
        }

        // stream_msg / guide_word / output_msg all carry text the same way.
        let text = data
            .pointer("/output_schema/message")
            .and_then(joined_text)
            .or_else(|| data.get("message").and_then(joined_text));

        match (status, text) {
            ("stream", Some(text)) => {
                self.append(&text);
                FrameOutcome::Updated
            }
            ("end", Some(text)) => {
                // End-of-node frames carry the whole text; replace rather
                // than append to avoid duplicating the streamed prefix.
                self.replace(&text);
                FrameOutcome::Updated
            }
            ("end", None) => FrameOutcome::Ignored,
            (_, Some(text)) => {
                self.append(&text);
                FrameOutcome::Updated
            }
            _ => FrameOutcome::Ignored,
        }
    }

    fn apply_flat(&mut self, value: &Value) -> FrameOutcome {
        let event = value.get("event").and_then(Value::as_str).unwrap_or("");

        match event {
            "guide_word" | "guide_question" | "input" => {
                return self.request_continuation();
            }
            "close" | "finish" | "done" => {
                let final_text = value
                    .get("summary")
                    .or_else(|| value.get("final"))
                    .and_then(joined_text);
                if let Some(text) = final_text {
                    self.replace(&text);
                }
                return FrameOutcome::Done;
            }
            _ => {}
        }

        if let Some(text) = flat_frame_text(value) {
            if text.is_empty() {
                return FrameOutcome::Ignored;
            }
            self.append(&text);
            return FrameOutcome::Updated;
        }

        debug!("Frame carried no recognized text: {}", value);
        FrameOutcome::Ignored
    }

    fn request_continuation(&mut self) -> FrameOutcome {
        if self.continuation_requested || self.continuation.session_id.is_none() {
            return FrameOutcome::Ignored;
        }
        self.continuation_requested = true;
        FrameOutcome::Continue
    }

    /// Record continuation ids present on any frame level. The session id is
    /// first-writer-wins for the turn; node and message ids track the latest
    /// observed value.
    fn record_ids(&mut self, value: &Value) {
        if let Some(sid) = string_field(value, &["session_id", "sessionId", "session"]) {
            self.record_session_id(sid);
        }
        if let Some(nid) = string_field(value, &["node_id", "nodeId"]) {
            self.continuation.node_id = Some(nid);
        }
        if let Some(mid) = string_field(value, &["message_id", "messageId"]) {
            self.continuation.message_id = Some(mid);
        }
    }

    fn record_session_id(&mut self, session_id: String) {
        if self.continuation.session_id.is_none() {
            self.continuation.session_id = Some(session_id);
        }
    }

    fn append(&mut self, text: &str) {
        self.content.push_str(text);
        self.saw_content = true;
    }

    fn replace(&mut self, text: &str) {
        self.content = text.to_string();
        self.saw_content = true;
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_str))
        .map(str::to_string)
}

/// A message value may be a plain string or an array of strings; arrays are
/// joined with newlines.
fn joined_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Extract text from a flat legacy frame, trying field names in priority
/// order.
fn flat_frame_text(value: &Value) -> Option<String> {
    for name in ["delta", "content", "text", "message", "msg", "result"] {
        if let Some(s) = value.get(name).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }

    for pointer in [
        "/choices/0/delta/content",
        "/choices/0/message/content",
        "/choices/0/text",
    ] {
        if let Some(s) = value.pointer(pointer).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }

    let outputs = value.get("outputs").or_else(|| value.get("output"))?;
    match outputs {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    string_field(item, &["value", "text", "content", "data"])
                        .or_else(|| item.as_str().map(str::to_string))
                })
                .collect();
            if parts.is_empty() { None } else { Some(parts.join("")) }
        }
        _ => None,
    }
}
