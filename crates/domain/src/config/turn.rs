use serde::{Deserialize, Serialize};

/// Turn Engine policy (§4.5): budget, compaction trigger, and gate dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Max agent-loop iterations within a single turn before forcing a
    /// `max_turns` exit.
    #[serde(default = "d_max_loops")]
    pub max_loops: u32,
    /// Context window percentage (§4.5.3) at which compaction is triggered,
    /// independent of the raw token threshold below.
    #[serde(default = "d_compaction_pct_threshold")]
    pub compaction_pct_threshold: f32,
    /// Raw token count at which compaction is triggered regardless of
    /// context window size.
    #[serde(default = "d_compaction_token_threshold")]
    pub compaction_token_threshold: usize,
    /// Whether gate dedup (§4.5.4) is enabled.
    #[serde(default = "d_gate_dedup_enabled")]
    pub gate_dedup_enabled: bool,
    /// How long a pending question's dedup fingerprint remains valid.
    #[serde(default = "d_gate_dedup_ttl_secs")]
    pub gate_dedup_ttl_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_loops: d_max_loops(),
            compaction_pct_threshold: d_compaction_pct_threshold(),
            compaction_token_threshold: d_compaction_token_threshold(),
            gate_dedup_enabled: d_gate_dedup_enabled(),
            gate_dedup_ttl_secs: d_gate_dedup_ttl_secs(),
        }
    }
}

fn d_max_loops() -> u32 {
    25
}
fn d_compaction_pct_threshold() -> f32 {
    0.85
}
fn d_compaction_token_threshold() -> usize {
    160_000
}
fn d_gate_dedup_enabled() -> bool {
    true
}
fn d_gate_dedup_ttl_secs() -> u64 {
    300
}
