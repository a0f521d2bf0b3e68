mod buffer;
mod config;
mod connect_redirector;
mod context;
mod dashboard;
mod error;
mod identity;
mod model;
mod proxy;
mod store;
mod tls;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::ProxyConfig;
use context::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::parse();
    let _logging_guard = init_logging(&config.log_level);

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("no other rustls CryptoProvider installed yet");

    let ca_dir = std::path::PathBuf::from(&config.ca_dir);
    let upstream_host = upstream_host(&config.upstream_url)?;

    if config.setup_tls {
        tls::ensure_tls_materials(&ca_dir, &upstream_host)?;
        println!("TLS materials ready under {}", ca_dir.display());
        return Ok(());
    }

    if config.setup_hosts {
        tls::print_hosts_entry(&config.host, &upstream_host);
        return Ok(());
    }

    tracing::info!(upstream = %config.upstream_url, host = %config.host, port = config.port, "starting compaction proxy");

    let resolved_ip = upstream::resolve_externally(&upstream_host).await?;
    tracing::info!(hostname = %upstream_host, ip = %resolved_ip, "resolved upstream via external DNS");
    let client = upstream::build_client(&upstream_host, 443, resolved_ip)?;

    let store = match store::db::Store::connect("./dbproxy.sqlite").await {
        Ok(store) => Some(store),
        Err(err) => {
            tracing::warn!(error = %err, "failed to open event store, continuing without persistence");
            None
        }
    };

    let ctx = AppContext::new(client, config.clone(), store);

    let materials = tls::ensure_tls_materials(&ca_dir, &upstream_host)?;
    let rustls_config = tls::load_rustls_config(&materials).await?;

    let app = build_router(ctx);

    if config.with_redirector {
        let redirector_config = connect_redirector::RedirectorConfig {
            listen_host: "0.0.0.0".to_string(),
            listen_port: config.redirector_port,
            redirect_host: upstream_host.clone(),
            proxy_target: (config.host.clone(), config.port),
        };
        tokio::spawn(async move {
            if let Err(err) = connect_redirector::run(redirector_config).await {
                tracing::error!(error = %err, "connect redirector exited");
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(%addr, "listening");
    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/v1/messages", post(proxy::handler::handle_messages))
        .route("/v1/_reset", post(reset_handler))
        .route("/health", get(health_handler))
        .route("/dashboard/ws", get(dashboard::ws::dashboard_ws))
        .route("/dashboard/api/conversations", get(dashboard::ws::list_conversations))
        .route("/dashboard/api/conversation/:key", get(dashboard::ws::conversation_snapshot))
        .fallback(passthrough_handler)
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
struct ResetQuery {
    conv_id: Option<String>,
}

async fn reset_handler(State(ctx): State<Arc<AppContext>>, Query(query): Query<ResetQuery>) -> impl IntoResponse {
    let found = proxy::handler::reset_conversation(&ctx, query.conv_id.as_deref()).await;
    Json(json!({"reset": found}))
}

async fn health_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "conversations": ctx.registry.len(),
        "passthrough": ctx.config.passthrough,
    }))
}

/// Everything outside `/v1/messages` that still needs to reach the real
/// upstream (e.g. other `/v1/*` endpoints, `/api/*`) — forwarded verbatim,
/// hop-by-hop headers stripped from the response.
async fn passthrough_handler(
    State(ctx): State<Arc<AppContext>>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let path = uri.path();
    if !(path.starts_with("/v1/") || path.starts_with("/api/")) {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    }

    let url = format!(
        "{}{}{}",
        ctx.config.upstream_url.trim_end_matches('/'),
        path,
        uri.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let mut req = ctx.client.request(method, url).headers(headers);
    if !body.is_empty() {
        req = req.body(body);
    }

    let response = match req.send().await {
        Ok(r) => r,
        Err(e) => return error::ProxyError::UpstreamTransport(e.to_string()).into_response(),
    };

    let status = response.status();
    let mut builder = axum::response::Response::builder().status(status);
    for (name, value) in response.headers().iter() {
        if matches!(name.as_str(), "transfer-encoding" | "connection" | "keep-alive") {
            continue;
        }
        builder = builder.header(name, value);
    }
    let raw = response.bytes().await.unwrap_or_default();
    builder
        .body(axum::body::Body::from(raw))
        .unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn upstream_host(upstream_url: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(upstream_url)?;
    parsed
        .host_str()
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("could not parse host from upstream URL: {upstream_url}"))
}

/// JSON logs to both stderr and an hourly-rotating file under `logs/`,
/// mirroring a tee'd structured log setup.
fn init_logging(log_level: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let file_appender = tracing_appender::rolling::hourly("logs", "dbproxy.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .with(fmt::layer().json().with_writer(non_blocking))
        .init();

    guard
}
