//! Build synthetic compaction responses for swap execution.
//!
//! Constructs both JSON and SSE-format responses carrying the stored
//! compaction content, shaped as an ordinary assistant text message so the
//! client treats it exactly like a native compaction reply.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::sse_parser::SseEvent;

/// Generate a synthetic `msg_` prefixed message id.
pub fn generate_message_id() -> String {
    let nonce = uuid::Uuid::new_v4();
    let digest = Sha256::digest(nonce.as_bytes());
    format!("msg_proxy_{}", hex::encode(&digest[..12]))
}

/// Build a non-streaming synthetic compaction response body.
pub fn build_compaction_json(compaction_content: &str, model: &str) -> Value {
    json!({
        "id": generate_message_id(),
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": compaction_content}],
        "model": model,
        "stop_reason": "end_turn",
        "stop_sequence": Value::Null,
        "usage": {"input_tokens": 0, "output_tokens": compaction_content.len() / 4},
    })
}

/// Build the fixed six-event SSE sequence for a streaming synthetic
/// compaction response. The entire body is delivered as a single delta.
pub fn build_compaction_sse_events(compaction_content: &str, model: &str) -> Vec<SseEvent> {
    let msg_id = generate_message_id();
    let output_tokens = compaction_content.len() / 4;

    vec![
        SseEvent {
            event: "message_start".to_string(),
            data: json!({
                "type": "message_start",
                "message": {
                    "id": msg_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 1},
                },
            })
            .to_string(),
            ..Default::default()
        },
        SseEvent {
            event: "content_block_start".to_string(),
            data: json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            })
            .to_string(),
            ..Default::default()
        },
        SseEvent {
            event: "content_block_delta".to_string(),
            data: json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": compaction_content},
            })
            .to_string(),
            ..Default::default()
        },
        SseEvent {
            event: "content_block_stop".to_string(),
            data: json!({"type": "content_block_stop", "index": 0}).to_string(),
            ..Default::default()
        },
        SseEvent {
            event: "message_delta".to_string(),
            data: json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": Value::Null},
                "usage": {"output_tokens": output_tokens},
            })
            .to_string(),
            ..Default::default()
        },
        SseEvent {
            event: "message_stop".to_string(),
            data: json!({"type": "message_stop"}).to_string(),
            ..Default::default()
        },
    ]
}

/// A swap response, in either wire shape.
pub enum SwapResponse {
    Json(Value),
    Sse(Vec<SseEvent>),
}

impl SwapResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SwapResponse::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            SwapResponse::Sse(events) => {
                let mut out = Vec::new();
                for event in events {
                    out.extend(event.to_bytes());
                }
                out
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SwapResponse::Json(_) => "application/json",
            SwapResponse::Sse(_) => "text/event-stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_streaming_response_has_single_text_block() {
        let value = build_compaction_json("hello world", "claude-opus-4-6");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "hello world");
        assert_eq!(value["stop_reason"], "end_turn");
        assert_eq!(value["usage"]["input_tokens"], 0);
    }

    #[test]
    fn streaming_response_is_six_events_with_full_body_in_one_delta() {
        let events = build_compaction_sse_events("hello world", "claude-opus-4-6");
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].event, "message_start");
        assert_eq!(events[2].event, "content_block_delta");
        let delta: Value = serde_json::from_str(&events[2].data).unwrap();
        assert_eq!(delta["delta"]["text"], "hello world");
        assert_eq!(events[5].event, "message_stop");
    }
}
