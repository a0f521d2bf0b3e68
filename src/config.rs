//! Runtime configuration, sourced from CLI flags with environment fallback.

use std::collections::HashMap;

use clap::Parser;

const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

#[derive(Debug, Clone, Parser)]
#[command(name = "compaction-proxy", about = "TLS-intercepting reverse proxy that precomputes conversation compaction in the background")]
pub struct ProxyConfig {
    #[arg(long, env = "DBPROXY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "DBPROXY_PORT", default_value_t = 443)]
    pub port: u16,

    #[arg(long, env = "DBPROXY_UPSTREAM_URL", default_value = "https://api.anthropic.com")]
    pub upstream_url: String,

    #[arg(long, env = "DBPROXY_CHECKPOINT_THRESHOLD", default_value_t = 0.60)]
    pub checkpoint_threshold: f64,

    #[arg(long, env = "DBPROXY_SWAP_THRESHOLD", default_value_t = 0.80)]
    pub swap_threshold: f64,

    #[arg(long, env = "DBPROXY_MAX_SSE_BUFFER_BYTES", default_value_t = 50_000_000)]
    pub max_sse_buffer_bytes: usize,

    #[arg(long, env = "DBPROXY_CONVERSATION_TTL_SECONDS", default_value_t = 7200)]
    pub conversation_ttl_seconds: u64,

    #[arg(long, env = "DBPROXY_PASSTHROUGH", default_value_t = false)]
    pub passthrough: bool,

    #[arg(long, env = "DBPROXY_COMPACT_TRIGGER_TOKENS", default_value_t = 50_000)]
    pub compact_trigger_tokens: u64,

    #[arg(long, env = "DBPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "DBPROXY_CA_DIR", default_value = "./tls")]
    pub ca_dir: String,

    /// Generate (or reuse) the CA/server TLS materials under `ca_dir` and exit.
    #[arg(long, default_value_t = false)]
    pub setup_tls: bool,

    /// Print the `/etc/hosts` entries needed to route the upstream hostname
    /// through this proxy, and exit.
    #[arg(long, default_value_t = false)]
    pub setup_hosts: bool,

    /// Also run the CONNECT-tunnel redirector for HTTPS_PROXY-style clients,
    /// on `--redirector-port`.
    #[arg(long, env = "DBPROXY_WITH_REDIRECTOR", default_value_t = false)]
    pub with_redirector: bool,

    #[arg(long, env = "DBPROXY_REDIRECTOR_PORT", default_value_t = 8080)]
    pub redirector_port: u16,

    #[arg(
        long,
        env = "DBPROXY_MODEL_CONTEXT_WINDOWS",
        default_value = "",
        value_parser = parse_model_context_windows,
    )]
    pub model_context_windows: HashMap<String, u64>,
}

impl ProxyConfig {
    /// Context window for `model`, falling back to the 200k default when the
    /// model isn't present in the override table.
    pub fn context_window_for(&self, model: &str) -> u64 {
        self.model_context_windows
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

/// Parse a `model=tokens,model2=tokens2` override list into a map. An empty
/// string (the default) yields an empty map.
fn parse_model_context_windows(raw: &str) -> Result<HashMap<String, u64>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    raw.split(',')
        .map(|pair| {
            let (model, tokens) = pair.split_once('=').ok_or_else(|| {
                format!("invalid model-context-window entry {pair:?}, expected model=tokens")
            })?;
            let tokens: u64 = tokens
                .trim()
                .parse()
                .map_err(|_| format!("invalid token count {:?} for model {:?}", tokens.trim(), model.trim()))?;
            Ok((model.trim().to_string(), tokens))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_falls_back_to_default() {
        let config = ProxyConfig::parse_from(["compaction-proxy"]);
        assert_eq!(config.context_window_for("claude-opus-4-6"), DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn context_window_override_takes_precedence() {
        let mut config = ProxyConfig::parse_from(["compaction-proxy"]);
        config.model_context_windows.insert("claude-haiku".to_string(), 100_000);
        assert_eq!(config.context_window_for("claude-haiku"), 100_000);
    }

    #[test]
    fn model_context_windows_parses_from_cli_flag() {
        let config = ProxyConfig::parse_from([
            "compaction-proxy",
            "--model-context-windows",
            "claude-haiku=100000,claude-opus-4-6=400000",
        ]);
        assert_eq!(config.context_window_for("claude-haiku"), 100_000);
        assert_eq!(config.context_window_for("claude-opus-4-6"), 400_000);
        assert_eq!(config.context_window_for("unknown-model"), DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn defaults_match_spec_thresholds() {
        let config = ProxyConfig::parse_from(["compaction-proxy"]);
        assert_eq!(config.checkpoint_threshold, 0.60);
        assert_eq!(config.swap_threshold, 0.80);
        assert_eq!(config.port, 443);
    }
}
