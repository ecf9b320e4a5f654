use serde::{Deserialize, Serialize};

/// Approval Bridge policy defaults (§4.3). Per-tool overrides live in the
/// permission policy consulted at runtime; this config only carries the
/// knobs the orchestration core itself needs at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Tool name prefixes that always require confirmation regardless of
    /// the permission policy's own verdict (defense in depth).
    #[serde(default = "d_always_confirm")]
    pub always_confirm: Vec<String>,
    /// Maximum description length before truncation in `action_pending`
    /// broadcasts and audit entries.
    #[serde(default = "d_description_max_chars")]
    pub description_max_chars: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            always_confirm: d_always_confirm(),
            description_max_chars: d_description_max_chars(),
        }
    }
}

fn d_always_confirm() -> Vec<String> {
    vec![
        "fs_writeFile".into(),
        "fs_editFile".into(),
        "git".into(),
        "exec".into(),
        "ssh".into(),
        "process".into(),
        "package_manager".into(),
        "workflow_trigger".into(),
    ]
}

fn d_description_max_chars() -> usize {
    200
}
