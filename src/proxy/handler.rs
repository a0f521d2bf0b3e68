//! The `/v1/messages` entry point: classify, consult the buffer manager,
//! and either synthesize a response or forward to the upstream.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::buffer::manager::BufferManager;
use crate::buffer::state_machine::BufferPhase;
use crate::context::AppContext;
use crate::error::ProxyError;
use crate::identity::fingerprint::{compute_fingerprint, registry_key};
use crate::model::{block_type, messages_of};

use super::request_rewriter::{is_compact_request, is_suggestion_request, strip_compact_edit, strip_compaction_blocks};
use super::sse_forwarder::SseForwarder;

const PHASE_HEADER: &str = "x-double-buffer-phase";
const CONV_ID_HEADER: &str = "x-double-buffer-conv-id";

/// Headers captured off the inbound request for reuse by background
/// checkpoint calls: auth plus the version/beta protocol tags.
const AUTH_SNAPSHOT_HEADERS: &[&str] = &["x-api-key", "authorization", "anthropic-version", "anthropic-beta"];

/// Headers forwarded verbatim on the live passthrough request.
const FORWARD_HEADERS: &[&str] = &[
    "x-api-key",
    "authorization",
    "content-type",
    "anthropic-version",
    "anthropic-beta",
    "anthropic-dangerous-direct-browser-access",
    "accept",
    "accept-encoding",
];

fn filter_headers(headers: &HeaderMap, allow: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in allow {
        if let Some(value) = headers.get(*name) {
            if let Ok(header_name) = HeaderName::try_from(*name) {
                out.insert(header_name, value.clone());
            }
        }
    }
    out
}

pub async fn handle_messages(
    State(ctx): State<Arc<AppContext>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&raw_body) {
        Ok(v) => v,
        Err(e) => return ProxyError::InvalidRequest(format!("invalid JSON body: {e}")).into_response(),
    };

    let model = body.get("model").and_then(Value::as_str).unwrap_or("unknown").to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let system = body.get("system").cloned();
    let tools = body.get("tools").cloned();
    let messages = messages_of(&body).to_vec();

    let auth_snapshot = filter_headers(&headers, AUTH_SNAPSHOT_HEADERS);
    let forward_headers = filter_headers(&headers, FORWARD_HEADERS);

    let fingerprint = compute_fingerprint(&body);
    let key = registry_key(&fingerprint, &model);
    let context_window = ctx.config.context_window_for(&model);
    let manager = ctx.registry.get_or_create(&key, &model, context_window, &ctx.config);
    manager.apply_config(&ctx.config).await;
    let conv_id_prefix = manager.conv_id_prefix().to_string();

    if is_suggestion_request(&body) {
        let response = forward_passthrough(&ctx, &model, stream, forward_headers, query, raw_body).await;
        notify_dashboard(&ctx, &manager, &model, "suggestion_mode_passthrough").await;
        return respond_with_diagnostics(response, &manager).await;
    }

    if crate::model::has_compaction_block(&messages) {
        manager.reset().await;
    }

    manager
        .update_request_snapshot(auth_snapshot, system.clone(), tools.clone(), messages.clone(), query.clone())
        .await;

    if ctx.config.passthrough {
        let response = forward_request(&ctx, &manager, &model, stream, forward_headers, query, raw_body).await;
        notify_dashboard(&ctx, &manager, &model, "passthrough_mode").await;
        return respond_with_diagnostics(response, &manager).await;
    }

    let swap_ready = manager.try_promote_to_swap_ready().await;
    if swap_ready {
        let response = execute_swap_response(&manager, &model, stream).await;
        notify_dashboard(&ctx, &manager, &model, "swap_executed").await;
        return respond_with_diagnostics(response, &manager).await;
    }

    if is_compact_request(&body) {
        match manager.handle_client_compact_request().await {
            Some(content) => {
                let response = synthetic_response(&content, &model, stream);
                notify_dashboard(&ctx, &manager, &model, "client_compact_request").await;
                return respond_with_diagnostics(response, &manager).await;
            }
            None => {
                // IDLE / CHECKPOINT_PENDING / checkpoint failed: fall through to a normal forward.
            }
        }
    }

    let rewritten = strip_compaction_blocks(&strip_compact_edit(&body));
    let rewritten_bytes = match serde_json::to_vec(&rewritten) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => return ProxyError::InvalidRequest(format!("failed to re-serialize request: {e}")).into_response(),
    };

    let response = forward_request(&ctx, &manager, &model, stream, forward_headers, query, rewritten_bytes).await;
    notify_dashboard(&ctx, &manager, &model, "forwarded").await;
    respond_with_diagnostics(response, &manager).await
}

async fn respond_with_diagnostics(response: Response, manager: &BufferManager) -> Response {
    let phase = manager.phase().await;
    let (mut parts, body) = response.into_parts();
    if let Ok(value) = HeaderValue::from_str(phase.as_str()) {
        parts.headers.insert(HeaderName::from_static(PHASE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(manager.conv_id_prefix()) {
        parts.headers.insert(HeaderName::from_static(CONV_ID_HEADER), value);
    }
    Response::from_parts(parts, body)
}

/// Tell the dashboard and the event store what phase this conversation is
/// in now. Best-effort: neither sink is allowed to affect the response.
async fn notify_dashboard(ctx: &AppContext, manager: &BufferManager, model: &str, trigger: &str) {
    let snapshot = manager.snapshot().await;
    ctx.dashboard.publish(crate::dashboard::broadcaster::DashboardEvent {
        registry_key: manager.conv_id_prefix().to_string(),
        conv_id_prefix: manager.conv_id_prefix().to_string(),
        phase: snapshot.phase,
        trigger: trigger.to_string(),
        utilization: snapshot.utilization,
    });
    ctx.event_sink.touch_conversation(manager.conv_id_prefix(), manager.conv_id_prefix(), model).await;
    ctx.event_sink
        .record_event(manager.conv_id_prefix(), trigger, snapshot.phase.as_str(), None)
        .await;
}

fn synthetic_response(content: &str, model: &str, stream: bool) -> Response {
    use super::response_builder::{build_compaction_json, build_compaction_sse_events, SwapResponse};

    let swap_response = if stream {
        SwapResponse::Sse(build_compaction_sse_events(content, model))
    } else {
        SwapResponse::Json(build_compaction_json(content, model))
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, swap_response.content_type())
        .body(axum::body::Body::from(swap_response.to_bytes()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn execute_swap_response(manager: &BufferManager, model: &str, stream: bool) -> Response {
    let content = manager.execute_swap().await;
    synthetic_response(&content, model, stream)
}

fn outbound_url(upstream_url: &str, query: &Option<String>) -> String {
    let mut url = format!("{}/v1/messages", upstream_url.trim_end_matches('/'));
    if let Some(qs) = query {
        if !qs.is_empty() {
            url.push('?');
            url.push_str(qs);
        }
    }
    url
}

/// Forward without touching manager state at all (suggestion mode).
async fn forward_passthrough(ctx: &Arc<AppContext>, model: &str, stream: bool, headers: HeaderMap, query: Option<String>, body: Bytes) -> Response {
    forward_raw(ctx, model, stream, headers, query, body, None).await
}

async fn forward_request(
    ctx: &Arc<AppContext>,
    manager: &Arc<BufferManager>,
    model: &str,
    stream: bool,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Response {
    forward_raw(ctx, model, stream, headers, query, body, Some(Arc::clone(manager))).await
}

async fn forward_raw(
    ctx: &Arc<AppContext>,
    _model: &str,
    stream: bool,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
    manager: Option<Arc<BufferManager>>,
) -> Response {
    let url = outbound_url(&ctx.config.upstream_url, &query);

    if stream {
        forward_streaming(Arc::clone(ctx), manager, url, headers, body).await
    } else {
        forward_non_streaming(ctx, manager, url, headers, body).await
    }
}

async fn forward_non_streaming(ctx: &Arc<AppContext>, manager: Option<Arc<BufferManager>>, url: String, headers: HeaderMap, body: Bytes) -> Response {
    let response = match ctx
        .client
        .post(&url)
        .headers(headers)
        .timeout(Duration::from_secs(120))
        .body(body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return ProxyError::UpstreamTransport(e.to_string()).into_response(),
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let raw = match response.bytes().await {
        Ok(b) => b,
        Err(e) => return ProxyError::UpstreamTransport(e.to_string()).into_response(),
    };

    if !status.is_success() {
        return ProxyError::UpstreamStatus { status, body: raw, content_type }.into_response();
    }

    if let Some(manager) = manager {
        if let Ok(value) = serde_json::from_slice::<Value>(&raw) {
            let has_compaction = value
                .get("content")
                .and_then(Value::as_array)
                .map(|blocks| blocks.iter().any(|b| block_type(b) == "compaction"))
                .unwrap_or(false);

            if has_compaction {
                manager.reset().await;
            } else if let Some(usage) = value.get("usage") {
                let input_tokens = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                let cache_creation = usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0);
                let cache_read = usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0);
                manager.update_tokens(input_tokens, cache_creation, cache_read).await;
                manager.evaluate_thresholds(&ctx.client).await;
            }
        }
    }

    Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, content_type.unwrap_or_else(|| "application/json".to_string()))
        .body(axum::body::Body::from(raw))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn forward_streaming(ctx: Arc<AppContext>, manager: Option<Arc<BufferManager>>, url: String, headers: HeaderMap, body: Bytes) -> Response {
    let response = match ctx
        .client
        .post(&url)
        .headers(headers)
        .timeout(Duration::from_secs(600))
        .body(body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return ProxyError::UpstreamTransport(e.to_string()).into_response(),
    };

    let status = response.status();
    if !status.is_success() {
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let raw = response.bytes().await.unwrap_or_default();
        return ProxyError::UpstreamStatus { status, body: raw, content_type }.into_response();
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let max_bytes = ctx.config.max_sse_buffer_bytes;
    let conv_id_prefix = manager.as_ref().map(|m| m.conv_id_prefix().to_string()).unwrap_or_default();
    let client = ctx.client.clone();

    tokio::spawn(async move {
        let mut forwarder = SseForwarder::new(conv_id_prefix);
        let mut total = 0usize;
        let mut stream = response.bytes_stream();
        let mut overflowed = false;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))).await;
                    return;
                }
            };
            total += chunk.len();
            if total > max_bytes {
                tracing::warn!(bytes = total, "sse buffer overflow, aborting stream");
                overflowed = true;
                break;
            }
            for event in forwarder.feed(&chunk) {
                if tx.send(Ok(Bytes::from(event.to_bytes()))).await.is_err() {
                    return;
                }
            }
        }

        let Some(manager) = manager else { return };
        if overflowed {
            return;
        }
        if forwarder.has_compaction() {
            manager.reset().await;
        } else {
            let usage = forwarder.usage();
            let input_tokens = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
            let cache_creation = usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0);
            let cache_read = usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0);
            manager.update_tokens(input_tokens, cache_creation, cache_read).await;
            manager.evaluate_thresholds(&client).await;
        }
    });

    let body = axum::body::Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Reset the conversation identified by `conv_id` (or all conversations if
/// `None`). Returns `false` if a specific prefix matched nothing.
pub async fn reset_conversation(ctx: &Arc<AppContext>, conv_id: Option<&str>) -> bool {
    match conv_id {
        Some(prefix) => match ctx.registry.get_by_prefix(prefix) {
            Some(manager) => {
                manager.reset().await;
                true
            }
            None => false,
        },
        None => {
            for key in ctx.registry.snapshot_keys() {
                if let Some(manager) = ctx.registry.get_by_prefix(&key) {
                    manager.reset().await;
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_only_whitelisted_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        headers.insert("x-unrelated", HeaderValue::from_static("nope"));
        let filtered = filter_headers(&headers, FORWARD_HEADERS);
        assert!(filtered.contains_key("x-api-key"));
        assert!(!filtered.contains_key("x-unrelated"));
    }

    #[test]
    fn outbound_url_preserves_query_string() {
        let url = outbound_url("https://api.anthropic.com", &Some("beta=true".to_string()));
        assert_eq!(url, "https://api.anthropic.com/v1/messages?beta=true");
    }

    #[test]
    fn outbound_url_without_query_has_no_trailing_question_mark() {
        let url = outbound_url("https://api.anthropic.com", &None);
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }
}
