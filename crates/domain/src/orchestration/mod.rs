//! Data model for the multi-agent orchestration core: conversation state,
//! obligations, gates (questions/approvals), actions, scheduled jobs, the
//! event envelope, and inbox messages.  See `ConversationState` for the
//! aggregate every other type here hangs off of.

mod action;
mod conversation_state;
mod envelope;
pub mod event_types;
mod gate;
mod inbox;
mod obligation;
mod plan;
mod preflight;
mod schedule;

pub use action::{sanitize_args, Action, ActionStatus};
pub use conversation_state::{
    AgentHistoryEntry, AgentKind, ConversationState, OrchestrationTask, ParallelExecution,
    ParallelStatus, Phase, TaskContext, TaskState, MAX_AGENT_HISTORY,
};
pub use envelope::{EventVisibility, WorkflowEventEnvelope};
pub use gate::{ApprovalRequest, RiskLevel, UserQuestion};
pub use inbox::InboxMessage;
pub use obligation::{Obligation, ObligationOrigin, ObligationStatus};
pub use plan::{Plan, PlanStep, StepOwner, StepStatus};
pub use preflight::{preflight_answer, IssueKind, PreflightIssue, PreflightResult};
pub use schedule::{ScheduledJob, ScheduleStatus};
