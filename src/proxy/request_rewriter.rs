//! Rewrite intercepted `/v1/messages` requests before forwarding.
//!
//! Strips the legacy `compact_20260112` context-management edit (kept for
//! defense-in-depth — see the Open Question in the design notes, current
//! clients no longer appear to emit it) and detects client-initiated
//! compact requests and suggestion-mode passthrough requests.

use serde_json::Value;

use crate::model::{flatten_text, messages_of, rewrite_compaction_blocks_to_text};

const COMPACT_EDIT_TYPE: &str = "compact_20260112";
const COMPACT_MARKER: &str = "create a detailed summary of the conversation";
const SUGGESTION_MARKER: &str = "[SUGGESTION MODE:";

/// Return a copy of `body` with the legacy `compact_20260112` context
/// management edit removed, preserving any other edits. If no edits remain
/// the `context_management` key is removed entirely.
pub fn strip_compact_edit(body: &Value) -> Value {
    let Some(edits) = body.pointer("/context_management/edits").and_then(Value::as_array) else {
        return body.clone();
    };

    let filtered: Vec<Value> = edits
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) != Some(COMPACT_EDIT_TYPE))
        .cloned()
        .collect();

    if filtered.len() == edits.len() {
        return body.clone();
    }

    let mut result = body.clone();
    if filtered.is_empty() {
        if let Some(obj) = result.as_object_mut() {
            obj.remove("context_management");
        }
    } else if let Some(edits_slot) = result.pointer_mut("/context_management/edits") {
        *edits_slot = Value::Array(filtered);
    }
    result
}

/// Whether the request carries the legacy `compact_20260112` edit.
pub fn has_compact_edit(body: &Value) -> bool {
    body.pointer("/context_management/edits")
        .and_then(Value::as_array)
        .map(|edits| {
            edits
                .iter()
                .any(|e| e.get("type").and_then(Value::as_str) == Some(COMPACT_EDIT_TYPE))
        })
        .unwrap_or(false)
}

/// Strip `compaction` content blocks from `body`'s messages, converting
/// them to text blocks the upstream will accept. A no-op copy if none are
/// present.
pub fn strip_compaction_blocks(body: &Value) -> Value {
    let messages = messages_of(body);
    let rewritten = rewrite_compaction_blocks_to_text(messages);
    let mut result = body.clone();
    if let Some(obj) = result.as_object_mut() {
        obj.insert("messages".to_string(), Value::Array(rewritten));
    }
    result
}

/// A chat request is a client-initiated compact request when the final
/// user message's flattened text contains the compact marker, case
/// insensitively.
pub fn is_compact_request(body: &Value) -> bool {
    let messages = messages_of(body);
    let Some(last) = messages.last() else {
        return false;
    };
    if last.get("role").and_then(Value::as_str) != Some("user") {
        return false;
    }
    flatten_text(last).to_lowercase().contains(COMPACT_MARKER)
}

/// Claude Code suggestion-mode requests are ephemeral and marked by
/// `[SUGGESTION MODE:` in the last user message; they bypass all buffer
/// logic and never update conversation state.
pub fn is_suggestion_request(body: &Value) -> bool {
    let messages = messages_of(body);
    let Some(last) = messages.last() else {
        return false;
    };
    if last.get("role").and_then(Value::as_str) != Some("user") {
        return false;
    }
    flatten_text(last).contains(SUGGESTION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_compact_edit_preserving_others() {
        let body = json!({
            "context_management": {"edits": [
                {"type": "compact_20260112"},
                {"type": "clear_thinking_20251015"},
            ]}
        });
        let result = strip_compact_edit(&body);
        let edits = result["context_management"]["edits"].as_array().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0]["type"], "clear_thinking_20251015");
    }

    #[test]
    fn strips_context_management_key_when_no_edits_remain() {
        let body = json!({"context_management": {"edits": [{"type": "compact_20260112"}]}});
        let result = strip_compact_edit(&body);
        assert!(result.get("context_management").is_none());
    }

    #[test]
    fn detects_compact_request_case_insensitively() {
        let body = json!({"messages": [{"role": "user", "content": "Please CREATE A DETAILED SUMMARY of the conversation now"}]});
        assert!(is_compact_request(&body));
    }

    #[test]
    fn non_user_last_message_is_not_a_compact_request() {
        let body = json!({"messages": [
            {"role": "user", "content": "create a detailed summary of the conversation"},
            {"role": "assistant", "content": "ok"},
        ]});
        assert!(!is_compact_request(&body));
    }

    #[test]
    fn detects_suggestion_mode() {
        let body = json!({"messages": [{"role": "user", "content": "[SUGGESTION MODE: foo] do something"}]});
        assert!(is_suggestion_request(&body));
    }
}
