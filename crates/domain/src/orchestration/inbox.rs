use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user message that arrived while a turn was already executing for the
/// session, queued until the turn engine drains it (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub source: String,
}

impl InboxMessage {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            received_at: Utc::now(),
            acknowledged: false,
            source: source.into(),
        }
    }
}
