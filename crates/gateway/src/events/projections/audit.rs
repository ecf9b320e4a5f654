//! Audit Projection (§4.4, §4.7): the authoritative, append-only trail of
//! every event regardless of visibility. Unlike the Stream and Markdown Log
//! projections it skips nothing — approval/rejection decisions, tool
//! argument payloads (already sanitized by `sa_domain::orchestration::sanitize_args`
//! upstream), and terminal responses all land here for later inspection.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::events::bus::Projection;
use crate::events::envelope::WorkflowEventEnvelope;

pub struct AuditProjection {
    log_path: PathBuf,
}

impl AuditProjection {
    pub fn new(state_path: &Path) -> std::io::Result<Self> {
        let dir = state_path.join("audit");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("audit.jsonl"),
        })
    }
}

#[async_trait::async_trait]
impl Projection for AuditProjection {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn handle(&self, event: &WorkflowEventEnvelope) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
