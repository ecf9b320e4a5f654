use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A question raised by a gate tool (`askUser`), suspending the turn until
/// answered. Deduplicated on `(turn_id, fingerprint)` when both are present
/// and dedup is enabled (§4.5.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuestion {
    pub question_id: String,
    pub question: String,
    pub from_agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub question_kind: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserQuestion {
    pub fn new(question: impl Into<String>, from_agent: impl Into<String>) -> Self {
        Self {
            question_id: uuid::Uuid::new_v4().to_string(),
            question: question.into(),
            from_agent: from_agent.into(),
            timestamp: Utc::now(),
            turn_id: None,
            question_kind: None,
            fingerprint: None,
            expires_at: None,
        }
    }

    /// Whether this question is still live for dedup purposes.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Matches another question for the `(turn_id, fingerprint)` dedup key
    /// (§4.5.4). Both sides must carry a fingerprint and an equal turn_id.
    pub fn dedup_matches(&self, turn_id: &str, fingerprint: &str) -> bool {
        self.turn_id.as_deref() == Some(turn_id)
            && self.fingerprint.as_deref() == Some(fingerprint)
    }
}

/// A request raised by `requestApproval`, suspending the turn until the
/// user decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub actions: Vec<String>,
    pub from_agent: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl ApprovalRequest {
    pub fn new(
        description: impl Into<String>,
        risk_level: RiskLevel,
        actions: Vec<String>,
        from_agent: impl Into<String>,
    ) -> Self {
        Self {
            approval_id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            risk_level,
            actions,
            from_agent: from_agent.into(),
            context: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_matches_requires_both_turn_and_fingerprint() {
        let mut q = UserQuestion::new("Soll ich weitermachen?", "chapo");
        q.turn_id = Some("turn-1".into());
        q.fingerprint = Some("continue:turn-1:same".into());

        assert!(q.dedup_matches("turn-1", "continue:turn-1:same"));
        assert!(!q.dedup_matches("turn-2", "continue:turn-1:same"));
        assert!(!q.dedup_matches("turn-1", "other"));
    }

    #[test]
    fn expiry() {
        let mut q = UserQuestion::new("x", "chapo");
        let now = Utc::now();
        assert!(!q.is_expired(now));
        q.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(q.is_expired(now));
    }
}
