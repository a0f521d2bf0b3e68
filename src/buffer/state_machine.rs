//! Buffer phase state machine.
//!
//! ```text
//! IDLE ──[utilization ≥ checkpoint_threshold]──→ CHECKPOINT_PENDING
//!                               │
//!               ┌───────────────┼───────────────┐
//!               │                               │
//!     [background task started]        [utilization ≥ swap_threshold, emergency]
//!               │                               │
//!               v                               │
//!         CHECKPOINTING                         │
//!               │                               │
//!     [checkpoint completes]                    │
//!               │                               │
//!               v                               │
//!         WAL_ACTIVE ←──────────────────────────┘
//!               │              (blocking checkpoint forced first)
//!     [utilization ≥ swap_threshold]
//!               │
//!               v
//!         SWAP_READY ──[next request]──→ SWAP_EXECUTING ──→ IDLE
//! ```

use std::collections::HashSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferPhase {
    Idle,
    CheckpointPending,
    Checkpointing,
    WalActive,
    SwapReady,
    SwapExecuting,
}

impl BufferPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferPhase::Idle => "IDLE",
            BufferPhase::CheckpointPending => "CHECKPOINT_PENDING",
            BufferPhase::Checkpointing => "CHECKPOINTING",
            BufferPhase::WalActive => "WAL_ACTIVE",
            BufferPhase::SwapReady => "SWAP_READY",
            BufferPhase::SwapExecuting => "SWAP_EXECUTING",
        }
    }
}

impl std::fmt::Display for BufferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn valid_transitions() -> &'static HashSet<(BufferPhase, BufferPhase)> {
    static SET: OnceLock<HashSet<(BufferPhase, BufferPhase)>> = OnceLock::new();
    SET.get_or_init(|| {
        use BufferPhase::*;
        HashSet::from([
            (Idle, CheckpointPending),
            (CheckpointPending, Checkpointing),
            // emergency: swap threshold hit before the background task started
            (CheckpointPending, WalActive),
            (Checkpointing, WalActive),
            (WalActive, SwapReady),
            (SwapReady, SwapExecuting),
            (SwapExecuting, Idle),
            // reset, from any non-idle state
            (CheckpointPending, Idle),
            (Checkpointing, Idle),
            (WalActive, Idle),
            (SwapReady, Idle),
            (SwapExecuting, Idle),
        ])
    })
}

/// Validate and execute a phase transition, logging the change.
///
/// An out-of-set transition means a caller violated the state machine's own
/// invariants — not a client-facing error condition, so this panics rather
/// than returning one. Callers must never fire a transition outside the
/// valid-transition set.
pub fn transition(
    current: BufferPhase,
    target: BufferPhase,
    conv_id_prefix: &str,
    trigger: &str,
) -> BufferPhase {
    if !valid_transitions().contains(&(current, target)) {
        tracing::error!(
            conv_id = %conv_id_prefix,
            from = current.as_str(),
            to = target.as_str(),
            trigger,
            "invalid phase transition attempted"
        );
        panic!("invalid buffer phase transition: {current} -> {target}");
    }
    tracing::info!(
        conv_id = %conv_id_prefix,
        from = current.as_str(),
        to = target.as_str(),
        trigger,
        "phase_transition"
    );
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transition_succeeds() {
        let next = transition(BufferPhase::Idle, BufferPhase::CheckpointPending, "abc", "t");
        assert_eq!(next, BufferPhase::CheckpointPending);
    }

    #[test]
    #[should_panic(expected = "invalid buffer phase transition")]
    fn invalid_transition_panics() {
        transition(BufferPhase::Idle, BufferPhase::SwapReady, "abc", "t");
    }

    #[test]
    fn reset_from_every_non_idle_state_is_valid() {
        for phase in [
            BufferPhase::CheckpointPending,
            BufferPhase::Checkpointing,
            BufferPhase::WalActive,
            BufferPhase::SwapReady,
            BufferPhase::SwapExecuting,
        ] {
            transition(phase, BufferPhase::Idle, "abc", "reset");
        }
    }
}
