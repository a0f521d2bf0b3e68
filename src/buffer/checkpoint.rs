//! Background checkpoint: anchor selection and the upstream summarization call.

use std::collections::HashSet;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};

use crate::model::{block_text, block_type, content_of, Content};

const BETA_HEADER: &str = "anthropic-beta";
const COMPACTION_BETA_TAG: &str = "context-management-2025-06-27";
const API_VERSION_HEADER: &str = "anthropic-version";
const API_VERSION: &str = "2023-06-01";
const CHECKPOINT_MAX_TOKENS: u64 = 4096;

/// Pick the exclusive end index a checkpoint may summarize up to, such that
/// no `tool_use` block in `messages[..anchor]` is left without its matching
/// `tool_result`.
pub fn find_checkpoint_anchor(messages: &[Value]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut tool_use_indices: Vec<(String, usize)> = Vec::new();
    let mut resolved_ids: HashSet<String> = HashSet::new();

    for (index, message) in messages.iter().enumerate() {
        if let Content::Blocks(blocks) = content_of(message) {
            for block in blocks {
                match block_type(block) {
                    "tool_use" => {
                        if let Some(id) = block.get("id").and_then(Value::as_str) {
                            tool_use_indices.push((id.to_string(), index));
                        }
                    }
                    "tool_result" => {
                        if let Some(id) = block.get("tool_use_id").and_then(Value::as_str) {
                            resolved_ids.insert(id.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let unresolved_min_index = tool_use_indices
        .iter()
        .filter(|(id, _)| !resolved_ids.contains(id))
        .map(|(_, index)| *index)
        .min();

    match unresolved_min_index {
        Some(index) => index,
        None => messages.len(),
    }
}

/// Convert any `compaction` content block in `messages` into a `text` block,
/// since the upstream rejects compaction blocks inside a checkpoint request.
fn sanitize_for_checkpoint(messages: &[Value]) -> Vec<Value> {
    crate::model::rewrite_compaction_blocks_to_text(messages)
}

pub struct CheckpointRequest<'a> {
    pub upstream_url: &'a str,
    pub model: &'a str,
    pub messages: &'a [Value],
    pub system: Option<&'a Value>,
    pub tools: Option<&'a Value>,
    pub auth_headers: &'a HeaderMap,
    pub query_string: Option<&'a str>,
    pub compact_trigger_tokens: u64,
}

/// Run the checkpoint call against the upstream, returning the summary
/// string from the returned `compaction` content block.
pub async fn run_checkpoint(client: &reqwest::Client, req: CheckpointRequest<'_>) -> anyhow::Result<String> {
    let anchor = find_checkpoint_anchor(req.messages);
    if anchor == 0 {
        anyhow::bail!("checkpoint anchor is zero, nothing to summarize");
    }

    let to_summarize = sanitize_for_checkpoint(&req.messages[..anchor]);

    let mut body = json!({
        "model": req.model,
        "max_tokens": CHECKPOINT_MAX_TOKENS,
        "messages": to_summarize,
        "context_management": {
            "edits": [{
                "type": "compact",
                "trigger": {"kind": "input_tokens", "value": req.compact_trigger_tokens},
                "pause_after_compaction": true,
            }],
        },
    });
    if let Some(system) = req.system {
        body["system"] = system.clone();
    }
    if let Some(tools) = req.tools {
        body["tools"] = tools.clone();
    }

    let mut url = format!("{}/v1/messages", req.upstream_url.trim_end_matches('/'));
    if let Some(qs) = req.query_string {
        if !qs.is_empty() {
            url.push('?');
            url.push_str(qs);
        }
    }

    let mut headers = req.auth_headers.clone();
    headers.insert(
        HeaderName::from_static(API_VERSION_HEADER),
        HeaderValue::from_static(API_VERSION),
    );
    headers.insert(
        HeaderName::from_static(BETA_HEADER),
        HeaderValue::from_static(COMPACTION_BETA_TAG),
    );

    let response = client
        .post(&url)
        .headers(headers)
        .timeout(Duration::from_secs(120))
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("checkpoint call failed with status {}", response.status());
    }

    let value: Value = response.json().await?;
    let content = value.get("content").and_then(Value::as_array).ok_or_else(|| {
        anyhow::anyhow!("checkpoint response has no content array")
    })?;

    content
        .iter()
        .find(|block| block_type(block) == "compaction")
        .map(|block| {
            block
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_else(|| block_text(block))
                .to_string()
        })
        .ok_or_else(|| anyhow::anyhow!("checkpoint response has no compaction block"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_message_list_anchors_at_zero() {
        assert_eq!(find_checkpoint_anchor(&[]), 0);
    }

    #[test]
    fn no_tool_use_anchors_at_full_length() {
        let messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
        ];
        assert_eq!(find_checkpoint_anchor(&messages), 2);
    }

    #[test]
    fn dangling_tool_use_anchors_before_it() {
        let messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "Read"}]}),
            json!({"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}),
            json!({"role": "assistant", "content": [{"type": "tool_use", "id": "t2", "name": "Read"}]}),
        ];
        assert_eq!(find_checkpoint_anchor(&messages), 3);
    }

    #[test]
    fn all_tool_uses_resolved_anchors_at_full_length() {
        let messages = vec![
            json!({"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "Read"}]}),
            json!({"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}),
        ];
        assert_eq!(find_checkpoint_anchor(&messages), 2);
    }
}
