//! Tiny CONNECT redirector for `HTTPS_PROXY`-style clients.
//!
//! Accepts HTTP CONNECT requests. If the target is the real upstream host
//! on port 443, redirects the TCP tunnel to the local proxy instead. Every
//! other target is tunneled straight through. This is not MITM: for
//! passthrough targets the client negotiates TLS directly with the
//! endpoint, same as any forward proxy.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const HEADER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RedirectorConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub redirect_host: String,
    pub proxy_target: (String, u16),
}

pub async fn run(config: RedirectorConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "connect redirector started");
    loop {
        let (socket, peer) = listener.accept().await?;
        let redirect_host = config.redirect_host.clone();
        let proxy_target = config.proxy_target.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connect(socket, &redirect_host, &proxy_target).await {
                tracing::debug!(%peer, error = %err, "connect handler exited");
            }
        });
    }
}

async fn handle_connect(socket: TcpStream, redirect_host: &str, proxy_target: &(String, u16)) -> anyhow::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    tokio::time::timeout(HEADER_TIMEOUT, reader.read_line(&mut request_line)).await??;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next();

    if method != "CONNECT" {
        write_half.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
        return Ok(());
    }
    let Some(target) = target else {
        write_half.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Ok(());
    };

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port_str)) => (host.to_string(), port_str.parse().unwrap_or(443)),
        None => (target.to_string(), 443u16),
    };

    loop {
        let mut header_line = String::new();
        let n = tokio::time::timeout(HEADER_TIMEOUT, reader.read_line(&mut header_line)).await??;
        if n == 0 || header_line == "\r\n" || header_line == "\n" {
            break;
        }
    }

    let (dest_host, dest_port) = if host == redirect_host && port == 443 {
        tracing::info!(target = %target, dest = ?proxy_target, "connect redirect");
        proxy_target.clone()
    } else {
        tracing::info!(target = %target, "connect passthrough");
        (host, port)
    };

    let upstream = match TcpStream::connect((dest_host.as_str(), dest_port)).await {
        Ok(stream) => stream,
        Err(err) => {
            write_half.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Err(err.into());
        }
    };
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    write_half.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;

    let client_to_upstream = tokio::io::copy(&mut reader, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut write_half);
    let _ = tokio::join!(client_to_upstream, upstream_to_client);

    Ok(())
}
