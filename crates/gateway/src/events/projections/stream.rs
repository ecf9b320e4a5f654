//! Stream Projection (§4.7): forwards events to UI subscribers (SSE/WS) in
//! near-real-time. Terminal responses (`wf.completed`/`wf.failed`) are sent
//! directly by the dispatcher, so the Stream Projection must never forward
//! them — otherwise the client would see the final answer twice.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use sa_domain::orchestration::event_types;

use crate::events::bus::Projection;
use crate::events::envelope::WorkflowEventEnvelope;

const CHANNEL_CAPACITY: usize = 256;

/// Per-session broadcast hub for the event stream.
pub struct StreamProjection {
    channels: RwLock<HashMap<String, broadcast::Sender<WorkflowEventEnvelope>>>,
}

impl StreamProjection {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a session's UI-facing event stream, creating its
    /// channel on first use.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<WorkflowEventEnvelope> {
        if let Some(tx) = self.channels.read().get(session_id) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write();
        let tx = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        tx.subscribe()
    }
}

impl Default for StreamProjection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Projection for StreamProjection {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn handle(&self, event: &WorkflowEventEnvelope) -> anyhow::Result<()> {
        if event_types::STREAM_SKIPPED.contains(&event.event_type.as_str()) {
            return Ok(());
        }
        if event.visibility != sa_domain::orchestration::EventVisibility::Ui {
            return Ok(());
        }

        let tx = {
            let channels = self.channels.read();
            channels.get(&event.session_id).cloned()
        };
        if let Some(tx) = tx {
            // No receivers is not an error — the UI may simply not be
            // connected right now.
            let _ = tx.send(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::orchestration::EventVisibility;

    fn event(event_type: &str) -> WorkflowEventEnvelope {
        WorkflowEventEnvelope::new(
            "s1",
            "r1",
            Some("t1".into()),
            "chapo",
            EventVisibility::Ui,
            event_type,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn skips_terminal_events() {
        let proj = StreamProjection::new();
        let mut rx = proj.subscribe("s1");
        proj.handle(&event(event_types::WF_COMPLETED)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_non_terminal_ui_events() {
        let proj = StreamProjection::new();
        let mut rx = proj.subscribe("s1");
        proj.handle(&event(event_types::AGENT_STARTED)).await.unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.event_type, event_types::AGENT_STARTED);
    }

    #[tokio::test]
    async fn skips_internal_visibility_events() {
        let proj = StreamProjection::new();
        let mut rx = proj.subscribe("s1");
        let mut internal = event(event_types::AGENT_THINKING);
        internal.visibility = EventVisibility::Internal;
        proj.handle(&internal).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
