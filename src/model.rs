//! Dynamic accessors over the upstream chat wire format.
//!
//! Inbound messages carry polymorphic content blocks (`text`, `tool_use`,
//! `tool_result`, `compaction`, `image`, and any future kind the upstream
//! adds). Rather than modeling every variant as a Rust enum — which would
//! have to be updated every time the upstream introduces a block type — we
//! keep messages as [`serde_json::Value`] and read them through small
//! `get`/`as_*` accessors. Unknown block kinds pass through untouched;
//! only the handful of kinds the proxy cares about get special-cased
//! rendering.

use serde_json::Value;

/// A message's `content` field, which is either a plain string or a list of
/// content blocks.
pub enum Content<'a> {
    Text(&'a str),
    Blocks(&'a [Value]),
    Empty,
}

pub fn role_of(message: &Value) -> &str {
    message.get("role").and_then(Value::as_str).unwrap_or("unknown")
}

pub fn content_of(message: &Value) -> Content<'_> {
    match message.get("content") {
        Some(Value::String(s)) => Content::Text(s),
        Some(Value::Array(arr)) => Content::Blocks(arr),
        _ => Content::Empty,
    }
}

pub fn block_type(block: &Value) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or("unknown")
}

pub fn block_text(block: &Value) -> &str {
    block.get("text").and_then(Value::as_str).unwrap_or("")
}

pub fn messages_of(body: &Value) -> &[Value] {
    body.get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Flatten a message's content into plain text, joining blocks with newlines.
/// Used for substring checks (compact markers, suggestion mode) that must
/// work whether the client sent a string or a content-block list.
pub fn flatten_text(message: &Value) -> String {
    match content_of(message) {
        Content::Text(s) => s.to_string(),
        Content::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                Value::String(s) => s.clone(),
                Value::Object(_) if block_type(b) == "text" => block_text(b).to_string(),
                _ => String::new(),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Content::Empty => String::new(),
    }
}

/// Whether any message in the list contains a `compaction` content block.
pub fn has_compaction_block(messages: &[Value]) -> bool {
    messages.iter().any(|m| match content_of(m) {
        Content::Blocks(blocks) => blocks.iter().any(|b| block_type(b) == "compaction"),
        _ => false,
    })
}

/// Rewrite every `compaction` content block in `messages` into a `text` block
/// with the same textual content (or a placeholder if empty). The upstream
/// API rejects compaction blocks inside ordinary requests; this lets a
/// client that already absorbed one of our synthetic swaps keep talking to
/// the real upstream.
pub fn rewrite_compaction_blocks_to_text(messages: &[Value]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut msg = msg.clone();
            if let Some(Value::Array(blocks)) = msg.get_mut("content") {
                for block in blocks.iter_mut() {
                    if block_type(block) == "compaction" {
                        let text = block
                            .get("content")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .unwrap_or("[conversation summary]")
                            .to_string();
                        *block = serde_json::json!({"type": "text", "text": text});
                    }
                }
            }
            msg
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_string_content() {
        let msg = json!({"role": "user", "content": "hello"});
        assert_eq!(flatten_text(&msg), "hello");
    }

    #[test]
    fn flattens_block_content() {
        let msg = json!({"role": "user", "content": [{"type": "text", "text": "hi"}, {"type": "tool_use", "name": "x"}]});
        assert_eq!(flatten_text(&msg), "hi");
    }

    #[test]
    fn detects_compaction_block() {
        let messages = vec![json!({"role": "assistant", "content": [{"type": "compaction", "content": "x"}]})];
        assert!(has_compaction_block(&messages));
    }

    #[test]
    fn rewrites_compaction_block_to_text() {
        let messages = vec![json!({"role": "assistant", "content": [{"type": "compaction", "content": "summary"}]})];
        let rewritten = rewrite_compaction_blocks_to_text(&messages);
        let block = &rewritten[0]["content"][0];
        assert_eq!(block["type"], "text");
        assert_eq!(block["text"], "summary");
    }

    #[test]
    fn rewrites_empty_compaction_block_to_placeholder() {
        let messages = vec![json!({"role": "assistant", "content": [{"type": "compaction", "content": ""}]})];
        let rewritten = rewrite_compaction_blocks_to_text(&messages);
        assert_eq!(rewritten[0]["content"][0]["text"], "[conversation summary]");
    }
}
