//! SSE forwarding pipeline: parse upstream SSE, intercept key events, and
//! forward bytes to the client as they arrive.
//!
//! Handles streaming responses from the upstream chat API, extracting usage
//! telemetry and detecting native compaction without buffering or
//! reordering any event.

use serde_json::Value;

use super::sse_parser::{SseEvent, SseParser};

/// Forwards SSE events from upstream to the client, intercepting usage data
/// and native-compaction detection along the way.
pub struct SseForwarder {
    conv_id_prefix: String,
    parser: SseParser,
    usage: Value,
    stop_reason: Option<String>,
    has_compaction: bool,
    content_blocks: Vec<Value>,
    current_block: Option<Value>,
    accumulated_text: String,
}

impl SseForwarder {
    pub fn new(conv_id_prefix: impl Into<String>) -> Self {
        Self {
            conv_id_prefix: conv_id_prefix.into(),
            parser: SseParser::new(),
            usage: Value::Null,
            stop_reason: None,
            has_compaction: false,
            content_blocks: Vec::new(),
            current_block: None,
            accumulated_text: String::new(),
        }
    }

    pub fn usage(&self) -> &Value {
        &self.usage
    }

    pub fn has_compaction(&self) -> bool {
        self.has_compaction
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Finalized content blocks, in order, each `text`-typed block carrying
    /// its fully accumulated text.
    pub fn content_blocks(&self) -> &[Value] {
        &self.content_blocks
    }

    /// Feed a raw chunk of upstream bytes, returning the parsed events in
    /// the order they should be forwarded to the client.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(chunk);
        let events = self.parser.feed(&text);
        for event in &events {
            self.process_event(event);
        }
        events
    }

    fn process_event(&mut self, event: &SseEvent) {
        if event.data.is_empty() {
            return;
        }
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };
        let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");

        match event_type {
            "message_start" => {
                if let Some(usage) = data.pointer("/message/usage") {
                    self.usage = usage.clone();
                }
            }
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("compaction") {
                    self.has_compaction = true;
                }
                self.current_block = Some(block);
            }
            "content_block_delta" => {
                let delta_type = data.pointer("/delta/type").and_then(Value::as_str).unwrap_or("");
                if delta_type == "text_delta" {
                    if let Some(text) = data.pointer("/delta/text").and_then(Value::as_str) {
                        self.accumulated_text.push_str(text);
                    }
                } else if delta_type == "compaction_delta" {
                    self.has_compaction = true;
                }
            }
            "content_block_stop" => {
                if let Some(mut block) = self.current_block.take() {
                    if block.get("type").and_then(Value::as_str) == Some("text") {
                        block["text"] = Value::String(std::mem::take(&mut self.accumulated_text));
                    }
                    self.content_blocks.push(block);
                    self.accumulated_text.clear();
                }
            }
            "message_delta" => {
                if let Some(stop_reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str)
                {
                    self.stop_reason = Some(stop_reason.to_string());
                }
                if let Some(usage) = data.get("usage").and_then(Value::as_object) {
                    let merged = self.usage.as_object_mut();
                    match merged {
                        Some(map) => {
                            for (k, v) in usage {
                                map.insert(k.clone(), v.clone());
                            }
                        }
                        None => self.usage = Value::Object(usage.clone()),
                    }
                }
            }
            _ => {}
        }
    }
}

impl Drop for SseForwarder {
    fn drop(&mut self) {
        tracing::debug!(
            conv_id = %self.conv_id_prefix,
            stop_reason = ?self.stop_reason,
            has_compaction = self.has_compaction,
            "sse_stream_complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_initial_usage_from_message_start() {
        let mut fwd = SseForwarder::new("abc");
        fwd.feed(b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n");
        assert_eq!(fwd.usage()["input_tokens"], 5);
    }

    #[test]
    fn detects_compaction_block_start() {
        let mut fwd = SseForwarder::new("abc");
        fwd.feed(b"event: content_block_start\ndata: {\"type\":\"content_block_start\",\"content_block\":{\"type\":\"compaction\"}}\n\n");
        assert!(fwd.has_compaction());
    }

    #[test]
    fn detects_compaction_delta() {
        let mut fwd = SseForwarder::new("abc");
        fwd.feed(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"compaction_delta\"}}\n\n");
        assert!(fwd.has_compaction());
    }

    #[test]
    fn merges_message_delta_usage_overwriting_fields() {
        let mut fwd = SseForwarder::new("abc");
        fwd.feed(b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n");
        fwd.feed(b"event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":42}}\n\n");
        assert_eq!(fwd.usage()["input_tokens"], 5);
        assert_eq!(fwd.usage()["output_tokens"], 42);
        assert_eq!(fwd.stop_reason(), Some("end_turn"));
    }

    #[test]
    fn accumulates_text_delta_and_finalizes_on_stop() {
        let mut fwd = SseForwarder::new("abc");
        fwd.feed(b"event: content_block_start\ndata: {\"type\":\"content_block_start\",\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n");
        fwd.feed(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n");
        fwd.feed(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n");
        fwd.feed(b"event: content_block_stop\ndata: {\"type\":\"content_block_stop\"}\n\n");
        assert_eq!(fwd.content_blocks().len(), 1);
        assert_eq!(fwd.content_blocks()[0]["text"], "Hello");
    }

    #[test]
    fn non_text_block_is_finalized_without_text_field() {
        let mut fwd = SseForwarder::new("abc");
        fwd.feed(b"event: content_block_start\ndata: {\"type\":\"content_block_start\",\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\"}}\n\n");
        fwd.feed(b"event: content_block_stop\ndata: {\"type\":\"content_block_stop\"}\n\n");
        assert_eq!(fwd.content_blocks().len(), 1);
        assert_eq!(fwd.content_blocks()[0]["id"], "t1");
        assert!(fwd.content_blocks()[0].get("text").is_none());
    }

    #[test]
    fn non_json_data_is_ignored_without_panic() {
        let mut fwd = SseForwarder::new("abc");
        let events = fwd.feed(b"event: ping\ndata: not json\n\n");
        assert_eq!(events.len(), 1);
    }
}
