//! Derive a stable conversation identity from the request body.
//!
//! The upstream protocol has no conversation id of its own — each request
//! carries the full message history. We need a key that stays the same
//! across turns of one conversation even as the tail of messages grows, so
//! we either read a client-supplied session id out of `metadata`, or hash
//! the parts of the request that don't change turn to turn: the system
//! prompt's prefix and the very first user message.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{content_of, flatten_text, messages_of, Content};

const SYSTEM_PREFIX_CHARS: usize = 1000;

static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_session_([0-9a-f-]+)$").unwrap());

/// Serialize a message's `system` field deterministically: strings pass
/// through, structured lists are serialized with sorted object keys so
/// equivalent content always hashes the same way regardless of field order.
fn serialize_system(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(_) => sort_keys(system).to_string(),
        Value::Null => String::new(),
        other => sort_keys(other).to_string(),
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), sort_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn first_user_message(body: &Value) -> Option<&Value> {
    messages_of(body).iter().find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
}

fn serialize_first_user_message(body: &Value) -> String {
    match first_user_message(body) {
        Some(message) => match content_of(message) {
            Content::Text(s) => s.to_string(),
            Content::Blocks(_) => flatten_text(message),
            Content::Empty => String::new(),
        },
        None => String::new(),
    }
}

/// Extract a client-supplied session id from `metadata.user_id`, matching
/// `_session_([0-9a-f-]+)$`, if present.
fn session_id_from_metadata(body: &Value) -> Option<String> {
    let metadata = body.get("metadata")?;
    let candidate = metadata.get("user_id").and_then(Value::as_str)?;
    SESSION_ID_RE.captures(candidate).map(|c| c[1].to_string())
}

/// Compute the conversation fingerprint for a request body.
pub fn compute_fingerprint(body: &Value) -> String {
    if let Some(session_id) = session_id_from_metadata(body) {
        return session_id;
    }

    let system_prefix = body
        .get("system")
        .map(serialize_system)
        .map(|s| truncate_chars(&s, SYSTEM_PREFIX_CHARS))
        .unwrap_or_default();
    let first_user = serialize_first_user_message(body);

    let mut hasher = Sha256::new();
    hasher.update(system_prefix.as_bytes());
    hasher.update(b"\n---\n");
    hasher.update(first_user.as_bytes());
    hex::encode(hasher.finalize())
}

/// Registry key combining fingerprint and model, since each model has an
/// independent context window.
pub fn registry_key(fingerprint: &str, model: &str) -> String {
    format!("{fingerprint}:{model}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uses_session_id_when_present() {
        let body = json!({"metadata": {"user_id": "acct_abc_session_deadbeef-1234"}});
        assert_eq!(compute_fingerprint(&body), "deadbeef-1234");
    }

    #[test]
    fn falls_back_to_hash_when_no_session_id() {
        let body = json!({"system": "you are helpful", "messages": [{"role": "user", "content": "hi"}]});
        let fp = compute_fingerprint(&body);
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn is_deterministic_for_the_same_body() {
        let body = json!({"system": "you are helpful", "messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(compute_fingerprint(&body), compute_fingerprint(&body));
    }

    #[test]
    fn is_stable_across_turns_with_same_system_and_first_message() {
        let turn1 = json!({"system": "s", "messages": [{"role": "user", "content": "first"}]});
        let turn2 = json!({
            "system": "s",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"},
            ],
        });
        assert_eq!(compute_fingerprint(&turn1), compute_fingerprint(&turn2));
    }

    #[test]
    fn structured_system_content_sorts_keys_before_hashing() {
        let a = json!({"system": [{"b": 1, "a": 2}], "messages": []});
        let b = json!({"system": [{"a": 2, "b": 1}], "messages": []});
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn registry_key_combines_fingerprint_and_model() {
        assert_eq!(registry_key("abc", "claude-opus-4-6"), "abc:claude-opus-4-6");
    }
}
