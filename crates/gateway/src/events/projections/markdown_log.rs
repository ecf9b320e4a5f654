//! Markdown Log Projection (§4.7): appends a human-readable narration of
//! the session to `<sessionId>.md` under the configured state path. Skips
//! internal noise (`agent.thinking`, `agent.history`, `system.heartbeat`)
//! that would otherwise drown out the actual conversation.

use std::io::Write;
use std::path::{Path, PathBuf};

use sa_domain::orchestration::event_types;

use crate::events::bus::Projection;
use crate::events::envelope::WorkflowEventEnvelope;

pub struct MarkdownLogProjection {
    base_dir: PathBuf,
}

impl MarkdownLogProjection {
    pub fn new(state_path: &Path) -> std::io::Result<Self> {
        let base_dir = state_path.join("markdown_logs");
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn render(event: &WorkflowEventEnvelope) -> Option<String> {
        let line = match event.event_type.as_str() {
            event_types::AGENT_STARTED => {
                format!("**{}** started", event.source)
            }
            event_types::AGENT_SWITCHED => {
                format!("→ switched to **{}**", event.source)
            }
            event_types::TOOL_CALL_STARTED => {
                let tool = event.payload.get("tool").and_then(|v| v.as_str()).unwrap_or("?");
                format!("- calling `{tool}`")
            }
            event_types::TOOL_ACTION_PENDING => {
                let tool = event.payload.get("tool").and_then(|v| v.as_str()).unwrap_or("?");
                format!("- ⏸ awaiting approval for `{tool}`")
            }
            event_types::GATE_QUESTION_QUEUED => {
                let text = event.payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
                format!("- ❓ {text}")
            }
            event_types::TASK_COMPLETED => {
                let title = event.payload.get("title").and_then(|v| v.as_str()).unwrap_or("");
                format!("- ✅ {title}")
            }
            event_types::WF_COMPLETED => "---\n**done**".to_string(),
            event_types::WF_FAILED => {
                let msg = event.payload.get("message").and_then(|v| v.as_str()).unwrap_or("");
                format!("---\n**failed**: {msg}")
            }
            _ => return None,
        };
        Some(line)
    }
}

#[async_trait::async_trait]
impl Projection for MarkdownLogProjection {
    fn name(&self) -> &'static str {
        "markdown_log"
    }

    async fn handle(&self, event: &WorkflowEventEnvelope) -> anyhow::Result<()> {
        if event_types::MARKDOWN_LOG_SKIPPED.contains(&event.event_type.as_str()) {
            return Ok(());
        }
        let Some(line) = Self::render(event) else {
            return Ok(());
        };

        let path = self.base_dir.join(format!("{}.md", event.session_id));
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
