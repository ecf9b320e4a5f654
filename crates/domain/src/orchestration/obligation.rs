use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked requirement derived from a user request that must eventually
/// be satisfied, waived, or failed.  One is created per meaningful user
/// utterance (see intake classification, §4.5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obligation {
    pub id: String,
    pub turn_id: String,
    pub origin: ObligationOrigin,
    pub blocking: bool,
    pub required_outcome: String,
    pub description: String,
    pub status: ObligationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationOrigin {
    Primary,
    Inbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Open,
    Satisfied,
    Failed,
    Waived,
}

impl Obligation {
    pub fn new(
        turn_id: impl Into<String>,
        origin: ObligationOrigin,
        blocking: bool,
        required_outcome: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id: turn_id.into(),
            origin,
            blocking,
            required_outcome: required_outcome.into(),
            description: description.into(),
            status: ObligationStatus::Open,
            created_at: Utc::now(),
            resolved_at: None,
            source_agent: None,
        }
    }

    /// Move the obligation to a terminal status. Per the invariant in §3,
    /// `status` only moves forward from `open`; calling this on a
    /// non-`open` obligation is a no-op.
    pub fn resolve(&mut self, status: ObligationStatus) {
        if self.status != ObligationStatus::Open {
            return;
        }
        debug_assert_ne!(status, ObligationStatus::Open, "resolve() requires a terminal status");
        self.status = status;
        self.resolved_at = Some(Utc::now());
    }

    pub fn waive(&mut self, _reason: &str) {
        self.resolve(ObligationStatus::Waived);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_moves_from_open_only() {
        let mut o = Obligation::new("t1", ObligationOrigin::Primary, true, "file written", "write notes.txt");
        assert_eq!(o.status, ObligationStatus::Open);
        o.resolve(ObligationStatus::Satisfied);
        assert_eq!(o.status, ObligationStatus::Satisfied);
        assert!(o.resolved_at.is_some());

        // Second resolve attempt is a no-op — status never moves backwards
        // or to a different terminal state.
        o.resolve(ObligationStatus::Failed);
        assert_eq!(o.status, ObligationStatus::Satisfied);
    }

    #[test]
    fn waive_sets_waived() {
        let mut o = Obligation::new("t1", ObligationOrigin::Inbox, false, "ack", "ack message");
        o.waive("superseded by explicit request");
        assert_eq!(o.status, ObligationStatus::Waived);
    }
}
