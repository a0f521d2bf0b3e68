//! Per-conversation buffer state: threshold evaluation, checkpoint
//! orchestration, and swap execution.

use std::sync::Arc;

use http::HeaderMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::checkpoint::{find_checkpoint_anchor, run_checkpoint, CheckpointRequest};
use super::state_machine::{transition, BufferPhase};
use super::swap::format_compaction_with_wal;

struct Inner {
    phase: BufferPhase,
    total_input_tokens: u64,
    context_window: u64,
    checkpoint_threshold: f64,
    swap_threshold: f64,
    compact_trigger_tokens: u64,
    checkpoint_content: Option<String>,
    checkpoint_anchor_index: Option<usize>,
    last_auth_headers: HeaderMap,
    last_system: Option<Value>,
    last_tools: Option<Value>,
    last_messages: Vec<Value>,
    last_query_string: Option<String>,
    checkpoint_task: Option<JoinHandle<()>>,
    last_swap_messages: Vec<Value>,
    last_swap_anchor: Option<usize>,
    last_checkpoint_content: Option<String>,
}

impl Inner {
    fn utilization(&self) -> f64 {
        if self.context_window == 0 {
            0.0
        } else {
            self.total_input_tokens as f64 / self.context_window as f64
        }
    }
}

/// A snapshot of a manager's externally-visible state, for diagnostics and
/// the health/dashboard endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerSnapshot {
    pub phase: BufferPhase,
    pub utilization: f64,
    pub total_input_tokens: u64,
}

/// Per-conversation-model buffer state machine and checkpoint orchestrator.
pub struct BufferManager {
    conv_id_prefix: String,
    model: String,
    upstream_url: String,
    inner: Mutex<Inner>,
}

impl BufferManager {
    pub fn new(
        conv_id_prefix: impl Into<String>,
        model: impl Into<String>,
        context_window: u64,
        checkpoint_threshold: f64,
        swap_threshold: f64,
        upstream_url: impl Into<String>,
        compact_trigger_tokens: u64,
    ) -> Self {
        Self {
            conv_id_prefix: conv_id_prefix.into(),
            model: model.into(),
            upstream_url: upstream_url.into(),
            inner: Mutex::new(Inner {
                phase: BufferPhase::Idle,
                total_input_tokens: 0,
                context_window,
                checkpoint_threshold,
                swap_threshold,
                compact_trigger_tokens,
                checkpoint_content: None,
                checkpoint_anchor_index: None,
                last_auth_headers: HeaderMap::new(),
                last_system: None,
                last_tools: None,
                last_messages: Vec::new(),
                last_query_string: None,
                checkpoint_task: None,
                last_swap_messages: Vec::new(),
                last_swap_anchor: None,
                last_checkpoint_content: None,
            }),
        }
    }

    pub fn conv_id_prefix(&self) -> &str {
        &self.conv_id_prefix
    }

    /// Record the most recent inbound request as the input for any future
    /// background checkpoint call.
    pub async fn update_request_snapshot(
        &self,
        auth_headers: HeaderMap,
        system: Option<Value>,
        tools: Option<Value>,
        messages: Vec<Value>,
        query_string: Option<String>,
    ) {
        let mut guard = self.inner.lock().await;
        guard.last_auth_headers = auth_headers;
        guard.last_system = system;
        guard.last_tools = tools;
        guard.last_messages = messages;
        guard.last_query_string = query_string;
    }

    /// Record token usage from the most recent upstream response.
    pub async fn update_tokens(&self, input_tokens: u64, cache_creation_input_tokens: u64, cache_read_input_tokens: u64) {
        let mut guard = self.inner.lock().await;
        guard.total_input_tokens = input_tokens + cache_creation_input_tokens + cache_read_input_tokens;
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        let guard = self.inner.lock().await;
        ManagerSnapshot {
            phase: guard.phase,
            utilization: guard.utilization(),
            total_input_tokens: guard.total_input_tokens,
        }
    }

    pub async fn phase(&self) -> BufferPhase {
        self.inner.lock().await.phase
    }

    /// Re-apply live configuration (thresholds, compact-trigger budget) to
    /// an already-running manager, so config changes take effect on the
    /// next request rather than only at conversation creation.
    pub async fn apply_config(&self, config: &crate::config::ProxyConfig) {
        let mut guard = self.inner.lock().await;
        guard.checkpoint_threshold = config.checkpoint_threshold;
        guard.swap_threshold = config.swap_threshold;
        guard.compact_trigger_tokens = config.compact_trigger_tokens;
    }

    /// Drive the phase state machine forward given the current utilization.
    /// Must be called after `update_tokens` for the same request.
    pub async fn evaluate_thresholds(self: &Arc<Self>, client: &reqwest::Client) {
        loop {
            let mut guard = self.inner.lock().await;
            let phase = guard.phase;
            let u = guard.utilization();

            match phase {
                BufferPhase::Idle if u >= guard.swap_threshold => {
                    self.run_emergency_checkpoint(&mut guard, client).await;
                    return;
                }
                BufferPhase::Idle if u >= guard.checkpoint_threshold => {
                    guard.phase = transition(guard.phase, BufferPhase::CheckpointPending, &self.conv_id_prefix, "checkpoint_threshold_crossed");
                    self.spawn_checkpoint_task(&mut guard, client.clone());
                    return;
                }
                BufferPhase::CheckpointPending if u >= guard.swap_threshold => {
                    self.spawn_checkpoint_task(&mut guard, client.clone());
                    let handle = guard.checkpoint_task.take();
                    drop(guard);
                    if let Some(handle) = handle {
                        let _ = handle.await;
                    }
                    // re-lock at the top of the loop and reassess
                }
                BufferPhase::Checkpointing if u >= guard.swap_threshold => {
                    let handle = guard.checkpoint_task.take();
                    drop(guard);
                    if let Some(handle) = handle {
                        let _ = handle.await;
                    }
                }
                BufferPhase::WalActive if u >= guard.swap_threshold => {
                    guard.phase = transition(guard.phase, BufferPhase::SwapReady, &self.conv_id_prefix, "swap_threshold_crossed");
                    return;
                }
                _ => return,
            }
        }
    }

    /// Promote `WAL_ACTIVE -> SWAP_READY` directly when a checkpoint is
    /// already in hand and utilization has independently crossed the swap
    /// threshold, saving a wasted upstream round trip. Returns whether the
    /// manager is (now) `SWAP_READY`.
    pub async fn try_promote_to_swap_ready(&self) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.phase == BufferPhase::SwapReady {
            return true;
        }
        if guard.phase == BufferPhase::WalActive && guard.checkpoint_content.is_some() && guard.utilization() >= guard.swap_threshold {
            guard.phase = transition(guard.phase, BufferPhase::SwapReady, &self.conv_id_prefix, "direct_swap_eligible");
            return true;
        }
        false
    }

    /// Client sent a request asking to compact now. Executes the swap when
    /// the manager can satisfy it immediately or after a pending checkpoint
    /// finishes; returns `None` when the request should fall through to an
    /// ordinary forward (`IDLE`, `CHECKPOINT_PENDING`, or a failed checkpoint).
    pub async fn handle_client_compact_request(self: &Arc<Self>) -> Option<String> {
        loop {
            let mut guard = self.inner.lock().await;
            match guard.phase {
                BufferPhase::WalActive => {
                    guard.phase = transition(guard.phase, BufferPhase::SwapReady, &self.conv_id_prefix, "client_compact_request");
                    drop(guard);
                    return Some(self.execute_swap().await);
                }
                BufferPhase::SwapReady => {
                    drop(guard);
                    return Some(self.execute_swap().await);
                }
                BufferPhase::Checkpointing => {
                    let handle = guard.checkpoint_task.take();
                    drop(guard);
                    if let Some(handle) = handle {
                        let _ = handle.await;
                    }
                    // loop: re-lock and reassess now that the task has settled
                }
                _ => return None,
            }
        }
    }

    /// Run the synchronous, blocking checkpoint path used when the very
    /// first observed utilization already exceeds the swap threshold.
    async fn run_emergency_checkpoint(&self, guard: &mut Inner, client: &reqwest::Client) {
        let anchor = find_checkpoint_anchor(&guard.last_messages);
        if anchor == 0 {
            tracing::warn!(conv_id = %self.conv_id_prefix, "emergency checkpoint skipped: empty anchor");
            return;
        }

        guard.phase = transition(guard.phase, BufferPhase::CheckpointPending, &self.conv_id_prefix, "emergency_checkpoint_started");

        let req = CheckpointRequest {
            upstream_url: &self.upstream_url,
            model: &self.model,
            messages: &guard.last_messages,
            system: guard.last_system.as_ref(),
            tools: guard.last_tools.as_ref(),
            auth_headers: &guard.last_auth_headers,
            query_string: guard.last_query_string.as_deref(),
            compact_trigger_tokens: guard.compact_trigger_tokens,
        };

        match run_checkpoint(client, req).await {
            Ok(content) => {
                guard.checkpoint_content = Some(content.clone());
                guard.checkpoint_anchor_index = Some(anchor);
                guard.last_checkpoint_content = Some(content);
                guard.phase = transition(guard.phase, BufferPhase::WalActive, &self.conv_id_prefix, "emergency_checkpoint_complete");
                guard.phase = transition(guard.phase, BufferPhase::SwapReady, &self.conv_id_prefix, "emergency_swap_ready");
            }
            Err(err) => {
                tracing::warn!(conv_id = %self.conv_id_prefix, error = %err, "emergency checkpoint failed");
                guard.phase = transition(guard.phase, BufferPhase::Idle, &self.conv_id_prefix, "emergency_checkpoint_failure");
            }
        }
    }

    /// Start the background checkpoint task if one isn't already running.
    /// Moves the phase `CHECKPOINT_PENDING -> CHECKPOINTING`.
    fn spawn_checkpoint_task(self: &Arc<Self>, guard: &mut Inner, client: reqwest::Client) {
        if guard.checkpoint_task.is_some() {
            return;
        }

        let anchor = find_checkpoint_anchor(&guard.last_messages);
        if anchor == 0 {
            tracing::warn!(conv_id = %self.conv_id_prefix, "background checkpoint skipped: empty anchor");
            guard.phase = transition(guard.phase, BufferPhase::Idle, &self.conv_id_prefix, "checkpoint_skipped_empty_anchor");
            return;
        }

        guard.phase = transition(guard.phase, BufferPhase::Checkpointing, &self.conv_id_prefix, "background_checkpoint_started");

        let upstream_url = self.upstream_url.clone();
        let model = self.model.clone();
        let compact_trigger_tokens = guard.compact_trigger_tokens;
        let messages = guard.last_messages.clone();
        let system = guard.last_system.clone();
        let tools = guard.last_tools.clone();
        let auth_headers = guard.last_auth_headers.clone();
        let query_string = guard.last_query_string.clone();
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let req = CheckpointRequest {
                upstream_url: &upstream_url,
                model: &model,
                messages: &messages,
                system: system.as_ref(),
                tools: tools.as_ref(),
                auth_headers: &auth_headers,
                query_string: query_string.as_deref(),
                compact_trigger_tokens,
            };
            let result = run_checkpoint(&client, req).await;
            let mut guard = manager.inner.lock().await;
            manager.finalize_background_checkpoint(&mut guard, result, anchor);
            guard.checkpoint_task = None;
        });

        guard.checkpoint_task = Some(handle);
    }

    fn finalize_background_checkpoint(&self, guard: &mut Inner, result: anyhow::Result<String>, anchor: usize) {
        if guard.phase != BufferPhase::Checkpointing {
            tracing::debug!(conv_id = %self.conv_id_prefix, phase = %guard.phase, "checkpoint completed in unexpected phase, ignoring");
            return;
        }

        match result {
            Ok(content) => {
                guard.checkpoint_content = Some(content.clone());
                guard.checkpoint_anchor_index = Some(anchor);
                guard.last_checkpoint_content = Some(content);
                guard.phase = transition(guard.phase, BufferPhase::WalActive, &self.conv_id_prefix, "background_checkpoint_complete");
                if guard.utilization() >= guard.swap_threshold {
                    guard.phase = transition(guard.phase, BufferPhase::SwapReady, &self.conv_id_prefix, "swap_threshold_crossed_on_checkpoint_complete");
                }
            }
            Err(err) => {
                tracing::warn!(conv_id = %self.conv_id_prefix, error = %err, "background checkpoint failed, resetting to idle");
                guard.phase = transition(guard.phase, BufferPhase::Idle, &self.conv_id_prefix, "checkpoint_failure");
            }
        }
    }

    /// Execute a swap: return the synthetic compaction body, clearing all
    /// checkpoint state and returning the manager to `IDLE`.
    pub async fn execute_swap(&self) -> String {
        let mut guard = self.inner.lock().await;

        guard.phase = transition(guard.phase, BufferPhase::SwapExecuting, &self.conv_id_prefix, "swap_triggered");

        let anchor = guard.checkpoint_anchor_index.unwrap_or(guard.last_messages.len());
        let wal: Vec<Value> = guard.last_messages.get(anchor..).map(<[Value]>::to_vec).unwrap_or_default();
        let checkpoint_content = guard
            .checkpoint_content
            .clone()
            .expect("SWAP_EXECUTING requires a checkpoint produced while WAL_ACTIVE/SWAP_READY");

        let body = format_compaction_with_wal(&checkpoint_content, &wal);

        guard.last_swap_messages = guard.last_messages.clone();
        guard.last_swap_anchor = Some(anchor);

        guard.checkpoint_content = None;
        guard.checkpoint_anchor_index = None;
        guard.total_input_tokens = 0;

        guard.phase = transition(guard.phase, BufferPhase::Idle, &self.conv_id_prefix, "swap_complete");

        body
    }

    /// Cancel any in-flight checkpoint and force the manager back to `IDLE`.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.checkpoint_task.take() {
            handle.abort();
        }
        if guard.phase != BufferPhase::Idle {
            guard.phase = transition(guard.phase, BufferPhase::Idle, &self.conv_id_prefix, "reset");
        }
        guard.total_input_tokens = 0;
        guard.checkpoint_content = None;
        guard.checkpoint_anchor_index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    fn make_manager() -> Arc<BufferManager> {
        Arc::new(BufferManager::new(
            "abc123",
            "claude-opus-4-6",
            200_000,
            0.60,
            0.80,
            "https://api.anthropic.com",
            50_000,
        ))
    }

    #[tokio::test]
    async fn below_checkpoint_threshold_stays_idle() {
        let manager = make_manager();
        manager.update_tokens(50_000, 0, 0).await;
        let client = reqwest::Client::new();
        manager.evaluate_thresholds(&client).await;
        assert_eq!(manager.phase().await, BufferPhase::Idle);
    }

    #[tokio::test]
    #[should_panic(expected = "invalid buffer phase transition")]
    async fn execute_swap_requires_swap_ready() {
        let manager = make_manager();
        manager.execute_swap().await;
    }

    #[tokio::test]
    async fn reset_clears_state_and_returns_to_idle() {
        let manager = make_manager();
        manager.update_tokens(100_000, 0, 0).await;
        manager.reset().await;
        let snap = manager.snapshot().await;
        assert_eq!(snap.phase, BufferPhase::Idle);
        assert_eq!(snap.total_input_tokens, 0);
    }

    #[tokio::test]
    async fn handle_client_compact_is_noop_outside_wal_active_or_swap_ready() {
        let manager = make_manager();
        let result = manager.handle_client_compact_request().await;
        assert!(result.is_none());
        assert_eq!(manager.phase().await, BufferPhase::Idle);
    }

    #[tokio::test]
    async fn emergency_path_skips_on_empty_anchor() {
        let manager = make_manager();
        manager
            .update_request_snapshot(HeaderMap::new(), None, None, Vec::new(), None)
            .await;
        manager.update_tokens(180_000, 0, 0).await;
        let client = reqwest::Client::new();
        manager.evaluate_thresholds(&client).await;
        assert_eq!(manager.phase().await, BufferPhase::Idle);
    }

    #[tokio::test]
    async fn apply_config_updates_live_thresholds_and_trigger_budget() {
        let manager = make_manager();
        let config = crate::config::ProxyConfig::parse_from([
            "compaction-proxy",
            "--checkpoint-threshold",
            "0.10",
            "--swap-threshold",
            "0.20",
            "--compact-trigger-tokens",
            "9000",
        ]);
        manager.apply_config(&config).await;
        manager.update_tokens(30_000, 0, 0).await;
        let client = reqwest::Client::new();
        // swap_threshold is now 0.20 (40_000 tokens); 30_000/200_000 = 0.15 crosses
        // the new checkpoint_threshold (0.10) but not the new swap_threshold.
        manager
            .update_request_snapshot(HeaderMap::new(), None, None, vec![json!({"role": "user", "content": "hi"})], None)
            .await;
        manager.evaluate_thresholds(&client).await;
        assert_eq!(manager.phase().await, BufferPhase::CheckpointPending);
    }

    #[tokio::test]
    async fn utilization_with_zero_window_is_zero() {
        let manager = BufferManager::new("abc", "m", 0, 0.60, 0.80, "https://api.anthropic.com", 50_000);
        manager.update_tokens(100, 0, 0).await;
        let snap = manager.snapshot().await;
        assert_eq!(snap.utilization, 0.0);
    }

    #[tokio::test]
    async fn execute_swap_after_manual_setup_returns_body_and_resets() {
        let manager = make_manager();
        manager
            .update_request_snapshot(
                HeaderMap::new(),
                None,
                None,
                vec![json!({"role": "user", "content": "hi"}), json!({"role": "assistant", "content": "after"})],
                None,
            )
            .await;
        {
            let mut guard = manager.inner.lock().await;
            guard.checkpoint_content = Some("a prior summary".to_string());
            guard.checkpoint_anchor_index = Some(1);
            guard.phase = transition(guard.phase, BufferPhase::CheckpointPending, "abc123", "test");
            guard.phase = transition(guard.phase, BufferPhase::Checkpointing, "abc123", "test");
            guard.phase = transition(guard.phase, BufferPhase::WalActive, "abc123", "test");
            guard.phase = transition(guard.phase, BufferPhase::SwapReady, "abc123", "test");
        }
        let body = manager.execute_swap().await;
        assert!(body.contains("a prior summary"));
        assert!(body.contains("<recent_activity>"));
        assert!(body.contains("after"));
        let snap = manager.snapshot().await;
        assert_eq!(snap.phase, BufferPhase::Idle);
        assert_eq!(snap.total_input_tokens, 0);
    }
}
