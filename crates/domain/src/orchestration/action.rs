use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A confirmation-gated tool call. Created by the Approval Bridge when a
/// tool requires confirmation; terminal after `done`/`failed`/`rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub description: String,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Correlation with a connected-node tool dispatch, when applicable.
    /// Additive only — never required to satisfy a spec invariant.
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Executing,
    Done,
    Failed,
    Rejected,
}

impl Action {
    pub fn new(
        tool_name: impl Into<String>,
        tool_args: serde_json::Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            tool_args,
            description: description.into(),
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            preview: None,
            approved_at: None,
            rejected_at: None,
            executed_at: None,
            result: None,
            error: None,
            node_id: None,
        }
    }

    /// `pending -> approved`. Only legal from `pending` (§3 invariant:
    /// `pending -> {approved -> executing -> {done|failed} | rejected}`).
    pub fn approve(&mut self) -> Result<()> {
        if self.status != ActionStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "action {} cannot be approved from status {:?}",
                self.id, self.status
            )));
        }
        self.status = ActionStatus::Approved;
        self.approved_at = Some(Utc::now());
        Ok(())
    }

    /// `pending -> rejected`. Illegal from any other state.
    pub fn reject(&mut self) -> Result<()> {
        if self.status != ActionStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "action {} cannot be rejected from status {:?}",
                self.id, self.status
            )));
        }
        self.status = ActionStatus::Rejected;
        self.rejected_at = Some(Utc::now());
        Ok(())
    }

    /// `approved -> executing`.
    pub fn start_executing(&mut self) -> Result<()> {
        if self.status != ActionStatus::Approved {
            return Err(Error::InvalidTransition(format!(
                "action {} cannot start executing from status {:?}",
                self.id, self.status
            )));
        }
        self.status = ActionStatus::Executing;
        Ok(())
    }

    /// `executing -> done`.
    pub fn finish_success(&mut self, result: serde_json::Value) -> Result<()> {
        if self.status != ActionStatus::Executing {
            return Err(Error::InvalidTransition(format!(
                "action {} cannot finish from status {:?}",
                self.id, self.status
            )));
        }
        self.status = ActionStatus::Done;
        self.executed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    /// `executing -> failed`.
    pub fn finish_failure(&mut self, error: impl Into<String>) -> Result<()> {
        if self.status != ActionStatus::Executing {
            return Err(Error::InvalidTransition(format!(
                "action {} cannot fail from status {:?}",
                self.id, self.status
            )));
        }
        self.status = ActionStatus::Failed;
        self.executed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ActionStatus::Done | ActionStatus::Failed | ActionStatus::Rejected
        )
    }
}

/// Truncate/elide args for audit logging: strings over 200 chars are cut
/// to a length marker, `content` fields are elided entirely (per §4.4).
pub fn sanitize_args(args: &serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if k == "content" {
                    let len = v.as_str().map(|s| s.len()).unwrap_or(0);
                    out.insert(k.clone(), serde_json::json!(format!("<elided, {len} chars>")));
                } else {
                    out.insert(k.clone(), sanitize_args(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::String(s) if s.len() > 200 => {
            serde_json::json!(format!("{}... <truncated, {} chars total>", &s[..200], s.len()))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_flow_success() {
        let mut a = Action::new("fs_writeFile", serde_json::json!({}), "write notes.txt");
        assert_eq!(a.status, ActionStatus::Pending);
        a.approve().unwrap();
        assert_eq!(a.status, ActionStatus::Approved);
        a.start_executing().unwrap();
        assert_eq!(a.status, ActionStatus::Executing);
        a.finish_success(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(a.status, ActionStatus::Done);
        assert!(a.is_terminal());
    }

    #[test]
    fn rejection_flow() {
        let mut a = Action::new("fs_writeFile", serde_json::json!({}), "write notes.txt");
        a.reject().unwrap();
        assert_eq!(a.status, ActionStatus::Rejected);
        assert!(a.is_terminal());
        // rejecting again is illegal
        assert!(a.reject().is_err());
    }

    #[test]
    fn cannot_skip_states() {
        let mut a = Action::new("fs_writeFile", serde_json::json!({}), "write notes.txt");
        assert!(a.start_executing().is_err());
        assert!(a.finish_success(serde_json::json!({})).is_err());
        a.approve().unwrap();
        assert!(a.approve().is_err()); // can't approve twice
        assert!(a.reject().is_err()); // can't reject after approve
    }

    #[test]
    fn failure_path() {
        let mut a = Action::new("exec", serde_json::json!({}), "run command");
        a.approve().unwrap();
        a.start_executing().unwrap();
        a.finish_failure("board unreachable").unwrap();
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.error.as_deref(), Some("board unreachable"));
    }

    #[test]
    fn sanitize_truncates_long_strings_and_elides_content() {
        let long = "x".repeat(300);
        let args = serde_json::json!({
            "path": "notes.txt",
            "content": long,
        });
        let sanitized = sanitize_args(&args);
        assert_eq!(sanitized["path"], serde_json::json!("notes.txt"));
        assert_eq!(sanitized["content"], serde_json::json!("<elided, 300 chars>"));
    }

    #[test]
    fn sanitize_truncates_non_content_long_string() {
        let long = "y".repeat(300);
        let args = serde_json::json!({ "description": long });
        let sanitized = sanitize_args(&args);
        let s = sanitized["description"].as_str().unwrap();
        assert!(s.contains("truncated, 300 chars total"));
    }
}
