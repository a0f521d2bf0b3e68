//! Error types for the proxy's hot path.
//!
//! Every cross-boundary failure is classified into one of these variants so
//! the request handler can translate it into a client-safe HTTP response
//! without ever leaking an internal panic into the wire.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors that can occur while handling an inbound `/v1/messages` request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream responded with a non-2xx status; body is forwarded verbatim.
    #[error("upstream returned status {status}")]
    UpstreamStatus {
        status: StatusCode,
        body: bytes::Bytes,
        content_type: Option<String>,
    },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("sse buffer overflow: {0} bytes")]
    SseOverflow(usize),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"type": "invalid_request", "message": message}})),
            )
                .into_response(),
            ProxyError::UpstreamStatus {
                status,
                body,
                content_type,
            } => {
                let ct = content_type.unwrap_or_else(|| "application/json".to_string());
                Response::builder()
                    .status(status)
                    .header(axum::http::header::CONTENT_TYPE, ct)
                    .body(axum::body::Body::from(body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            ProxyError::UpstreamTransport(message) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": {"type": "proxy_error", "message": message}})),
            )
                .into_response(),
            ProxyError::SseOverflow(bytes) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": {"type": "proxy_error", "message": format!("sse buffer overflow after {bytes} bytes")}
                })),
            )
                .into_response(),
        }
    }
}
