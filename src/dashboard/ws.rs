//! WebSocket endpoint streaming dashboard events, plus a small JSON API for
//! point-in-time conversation lookups.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::context::AppContext;

pub async fn dashboard_ws(State(ctx): State<Arc<AppContext>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<AppContext>) {
    let mut rx = ctx.dashboard.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(payload) => payload,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

pub async fn conversation_snapshot(State(ctx): State<Arc<AppContext>>, Path(key_prefix): Path<String>) -> impl IntoResponse {
    match ctx.registry.get_by_prefix(&key_prefix) {
        Some(manager) => {
            let snapshot = manager.snapshot().await;
            Json(json!({ "found": true, "snapshot": snapshot })).into_response()
        }
        None => Json(json!({ "found": false })).into_response(),
    }
}

pub async fn list_conversations(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(json!({ "keys": ctx.registry.snapshot_keys() }))
}
