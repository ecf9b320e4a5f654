use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApprovalRequest, Obligation, Plan, UserQuestion};

/// Bound on persisted `agentHistory` length (§3 invariant).
pub const MAX_AGENT_HISTORY: usize = 200;

/// The authoritative per-session conversation state (§3). Owned by the
/// State Store; mutated only through `ConversationState`'s methods under
/// the store's per-session exclusion scope — never field-by-field from
/// outside this module, so the bounded/invariant-preserving behavior
/// (history trimming, plan versioning, obligation monotonicity) cannot be
/// bypassed by a careless caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub phase: Phase,
    pub active_agent: AgentKind,
    #[serde(default)]
    pub agent_history: Vec<AgentHistoryEntry>,
    pub task_context: TaskContext,
    #[serde(default)]
    pub pending_approvals: Vec<ApprovalRequest>,
    #[serde(default)]
    pub pending_questions: Vec<UserQuestion>,
    #[serde(default)]
    pub parallel_executions: Vec<ParallelExecution>,
    #[serde(default)]
    pub tasks: HashMap<String, OrchestrationTask>,
    #[serde(default)]
    pub task_order: Vec<String>,
    #[serde(default)]
    pub is_loop_running: bool,
    #[serde(default)]
    pub current_plan: Option<Plan>,
    #[serde(default)]
    pub plan_history: Vec<Plan>,
    #[serde(default)]
    pub obligations: Vec<Obligation>,
    #[serde(default)]
    pub active_turn_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    WaitingUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Chapo,
    Devo,
    Caio,
    Scout,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Chapo => "chapo",
            AgentKind::Devo => "devo",
            AgentKind::Caio => "caio",
            AgentKind::Scout => "scout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHistoryEntry {
    pub agent: AgentKind,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskContext {
    #[serde(default)]
    pub original_request: Option<String>,
    #[serde(default)]
    pub gathered_info: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub gathered_files: Vec<String>,
    #[serde(default)]
    pub approval_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelExecution {
    pub id: String,
    pub agent: AgentKind,
    pub objective: String,
    pub status: ParallelStatus,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationTask {
    pub id: String,
    pub title: String,
    pub status: TaskState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Todo,
    InProgress,
    Done,
    Failed,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            active_agent: AgentKind::Chapo,
            agent_history: Vec::new(),
            task_context: TaskContext::default(),
            pending_approvals: Vec::new(),
            pending_questions: Vec::new(),
            parallel_executions: Vec::new(),
            tasks: HashMap::new(),
            task_order: Vec::new(),
            is_loop_running: false,
            current_plan: None,
            plan_history: Vec::new(),
            obligations: Vec::new(),
            active_turn_id: None,
        }
    }
}

impl ConversationState {
    /// Record an agent switch, trimming history to `MAX_AGENT_HISTORY`
    /// (§3 invariant: `agentHistory` length ≤ 200 in persisted form).
    pub fn push_agent_history(&mut self, agent: AgentKind) {
        self.agent_history.push(AgentHistoryEntry {
            agent,
            entered_at: Utc::now(),
        });
        self.trim_agent_history();
    }

    pub fn trim_agent_history(&mut self) {
        if self.agent_history.len() > MAX_AGENT_HISTORY {
            let excess = self.agent_history.len() - MAX_AGENT_HISTORY;
            self.agent_history.drain(0..excess);
        }
    }

    /// §4.5.1 step 4: a stale persisted `true` MUST be reset on load if no
    /// runtime loop exists for that session (§3 invariant, §8 invariant 1).
    pub fn reset_stale_loop_flag(&mut self) {
        self.is_loop_running = false;
    }

    /// Waive every obligation whose `turn_id` differs from `new_turn_id`
    /// and is still `open` (§4.5.1 step 4, §8 invariant 7).
    pub fn waive_superseded_obligations(&mut self, new_turn_id: &str) {
        for obligation in &mut self.obligations {
            if obligation.turn_id != new_turn_id
                && obligation.status == super::ObligationStatus::Open
            {
                obligation.waive("superseded by explicit request");
            }
        }
    }

    /// Find a pending question matching the `(turn_id, fingerprint)` dedup
    /// key (§4.5.4), if any non-expired one exists.
    pub fn find_pending_question_dedup(
        &self,
        turn_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Option<&UserQuestion> {
        self.pending_questions
            .iter()
            .find(|q| q.dedup_matches(turn_id, fingerprint) && !q.is_expired(now))
    }

    /// Remove expired questions matching the dedup key so a fresh one can
    /// be enqueued in their place (§4.5.4).
    pub fn remove_expired_dedup_question(&mut self, turn_id: &str, fingerprint: &str, now: DateTime<Utc>) {
        self.pending_questions
            .retain(|q| !(q.dedup_matches(turn_id, fingerprint) && q.is_expired(now)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_history_trims_to_bound() {
        let mut state = ConversationState::default();
        for _ in 0..(MAX_AGENT_HISTORY + 50) {
            state.push_agent_history(AgentKind::Devo);
        }
        assert_eq!(state.agent_history.len(), MAX_AGENT_HISTORY);
    }

    #[test]
    fn stale_loop_flag_resets() {
        let mut state = ConversationState {
            is_loop_running: true,
            ..ConversationState::default()
        };
        state.reset_stale_loop_flag();
        assert!(!state.is_loop_running);
    }

    #[test]
    fn waive_superseded_obligations_only_waives_open_other_turn() {
        use super::super::{ObligationOrigin, ObligationStatus};
        let mut state = ConversationState::default();
        let mut o1 = Obligation::new("turn-1", ObligationOrigin::Primary, true, "x", "y");
        let mut o2 = Obligation::new("turn-2", ObligationOrigin::Primary, true, "x", "y");
        o2.status = ObligationStatus::Satisfied; // already terminal, must stay put
        let o3 = Obligation::new("turn-3", ObligationOrigin::Primary, true, "x", "y"); // same as new turn
        state.obligations = vec![o1.clone(), o2.clone(), o3.clone()];

        state.waive_superseded_obligations("turn-3");

        assert_eq!(state.obligations[0].status, ObligationStatus::Waived); // turn-1, was open -> waived
        assert_eq!(state.obligations[1].status, ObligationStatus::Satisfied); // untouched terminal state
        assert_eq!(state.obligations[2].status, ObligationStatus::Open); // same turn, untouched
        let _ = o1;
    }

    #[test]
    fn dedup_lookup_and_expiry_cleanup() {
        let mut state = ConversationState::default();
        let mut q = UserQuestion::new("Soll ich weitermachen?", "chapo");
        q.turn_id = Some("turn-1".into());
        q.fingerprint = Some("continue:turn-1:same".into());
        state.pending_questions.push(q);

        let now = Utc::now();
        assert!(state.find_pending_question_dedup("turn-1", "continue:turn-1:same", now).is_some());

        // Expire it, then confirm cleanup removes it.
        state.pending_questions[0].expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(state.find_pending_question_dedup("turn-1", "continue:turn-1:same", now).is_none());
        state.remove_expired_dedup_question("turn-1", "continue:turn-1:same", now);
        assert!(state.pending_questions.is_empty());
    }
}
