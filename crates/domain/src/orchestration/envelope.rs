use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single domain event flowing through the bus (§2, §4.7). Immutable
/// once created; the bus fans it out to every registered projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventEnvelope {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub request_id: String,
    pub turn_id: Option<String>,
    pub source: String,
    pub visibility: EventVisibility,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventVisibility {
    Ui,
    Internal,
}

impl WorkflowEventEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        turn_id: Option<String>,
        source: impl Into<String>,
        visibility: EventVisibility,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            session_id: session_id.into(),
            request_id: request_id.into(),
            turn_id,
            source: source.into(),
            visibility,
            event_type: event_type.into(),
            payload,
        }
    }
}
