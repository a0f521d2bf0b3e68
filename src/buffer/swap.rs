//! Serialize the write-ahead log into the text the swap response delivers.
//!
//! A swap never re-sends the WAL as structured messages — the upstream has
//! no slot for "messages since the checkpoint" in a synthetic reply, so the
//! whole WAL is flattened into a single `<recent_activity>` block appended
//! after the stored checkpoint summary.

use serde_json::Value;

use crate::model::{block_text, block_type, content_of, role_of, Content};

const TOOL_USE_BRIEF_KEYS: &[&str] = &["file_path", "path", "pattern", "command", "query", "url"];
const TOOL_USE_BRIEF_MAX: usize = 150;
const TOOL_RESULT_MAX: usize = 300;
const TOOL_RESULT_SUBBLOCK_MAX: usize = 200;

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn serialize_tool_use(block: &Value) -> String {
    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
    let input = block.get("input");

    let brief = TOOL_USE_BRIEF_KEYS
        .iter()
        .find_map(|key| input.and_then(|i| i.get(key)).and_then(Value::as_str))
        .map(|s| truncate(s, TOOL_USE_BRIEF_MAX))
        .unwrap_or_else(|| {
            let encoded = input.map(|i| i.to_string()).unwrap_or_default();
            truncate(&encoded, TOOL_USE_BRIEF_MAX)
        });

    format!("[tool_use: {name}({brief})]")
}

fn summarize_tool_result(block: &Value) -> String {
    let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    let label = if is_error { "[tool_result ERROR]" } else { "[tool_result]" };

    let body = match block.get("content") {
        Some(Value::String(s)) => truncate(s, TOOL_RESULT_MAX),
        Some(Value::Array(items)) => {
            let joined = items
                .iter()
                .filter(|b| block_type(b) == "text")
                .map(|b| truncate(block_text(b), TOOL_RESULT_SUBBLOCK_MAX))
                .collect::<Vec<_>>()
                .join(" ");
            truncate(&joined, TOOL_RESULT_MAX)
        }
        _ => String::new(),
    };

    if body.is_empty() {
        label.to_string()
    } else {
        format!("{label} {body}")
    }
}

fn serialize_block(block: &Value) -> String {
    match block_type(block) {
        "text" => block_text(block).to_string(),
        "tool_use" => serialize_tool_use(block),
        "tool_result" => summarize_tool_result(block),
        "compaction" => "[prior compaction summary]".to_string(),
        kind => format!("[{kind} block]"),
    }
}

/// Render a single WAL message as `[role]\n<rendered content>`.
pub fn serialize_message(message: &Value) -> String {
    let role = role_of(message);
    let rendered = match content_of(message) {
        Content::Text(s) => s.to_string(),
        Content::Blocks(blocks) => blocks
            .iter()
            .map(serialize_block)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Content::Empty => String::new(),
    };
    format!("[{role}]\n{rendered}")
}

/// Serialize the WAL (messages since the checkpoint anchor) into the text
/// block embedded in `<recent_activity>`.
pub fn serialize_wal(wal: &[Value]) -> String {
    wal.iter().map(serialize_message).collect::<Vec<_>>().join("\n\n")
}

/// Combine a stored checkpoint summary with the serialized WAL into the
/// final compaction body delivered as the swap response text.
pub fn format_compaction_with_wal(checkpoint_content: &str, wal: &[Value]) -> String {
    let mut body = format!(
        "<context_summary>\n\
         This is a summary of the conversation so far. All prior context has\n\
         been incorporated below. Respond normally to the user's next message.\n\n\
         {checkpoint_content}"
    );

    if !wal.is_empty() {
        let serialized = serialize_wal(wal);
        body.push_str(&format!(
            "\n\n\
             The following conversation continued after the summary above was\n\
             generated. Tool calls are summarized and tool results are\n\
             abbreviated — re-read files if you need full contents. Continue\n\
             from where this conversation left off.\n\
             <recent_activity>\n\
             {serialized}\n\
             </recent_activity>"
        ));
    }

    body.push_str("\n</context_summary>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_text_message() {
        let message = json!({"role": "user", "content": "hello there"});
        assert_eq!(serialize_message(&message), "[user]\nhello there");
    }

    #[test]
    fn serializes_tool_use_with_preferred_brief_key() {
        let block = json!({"type": "tool_use", "name": "Read", "input": {"file_path": "/a/b.rs", "other": "x"}});
        assert_eq!(serialize_block(&block), "[tool_use: Read(/a/b.rs)]");
    }

    #[test]
    fn serializes_tool_use_falling_back_to_json_encoding() {
        let block = json!({"type": "tool_use", "name": "Calc", "input": {"a": 1, "b": 2}});
        let rendered = serialize_block(&block);
        assert!(rendered.starts_with("[tool_use: Calc("));
    }

    #[test]
    fn serializes_tool_result_error_with_string_content() {
        let block = json!({"type": "tool_result", "is_error": true, "content": "boom"});
        assert_eq!(summarize_tool_result(&block), "[tool_result ERROR] boom");
    }

    #[test]
    fn serializes_tool_result_joining_text_subblocks() {
        let block = json!({"type": "tool_result", "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(summarize_tool_result(&block), "[tool_result] a b");
    }

    #[test]
    fn truncates_long_tool_result_text() {
        let long = "x".repeat(400);
        let block = json!({"type": "tool_result", "content": long});
        let rendered = summarize_tool_result(&block);
        assert_eq!(rendered.len(), "[tool_result] ".len() + TOOL_RESULT_MAX);
    }

    #[test]
    fn compaction_block_renders_as_placeholder() {
        let block = json!({"type": "compaction", "content": "old summary"});
        assert_eq!(serialize_block(&block), "[prior compaction summary]");
    }

    #[test]
    fn unknown_block_kind_renders_generically() {
        let block = json!({"type": "thinking"});
        assert_eq!(serialize_block(&block), "[thinking block]");
    }

    #[test]
    fn format_without_wal_omits_recent_activity_frame() {
        let body = format_compaction_with_wal("summary text", &[]);
        assert!(body.contains("summary text"));
        assert!(!body.contains("<recent_activity>"));
    }

    #[test]
    fn format_with_wal_includes_recent_activity_frame() {
        let wal = vec![json!({"role": "user", "content": "follow up"})];
        let body = format_compaction_with_wal("summary text", &wal);
        assert!(body.contains("<recent_activity>"));
        assert!(body.contains("[user]\nfollow up"));
        assert!(body.contains("</recent_activity>"));
    }
}
