//! Domain event type name constants (§6.3's catalog). Using constants
//! instead of a closed enum keeps `WorkflowEventEnvelope::event_type`
//! forward-compatible with event types introduced by node/MCP-sourced
//! tools without needing a matching Rust variant for every one.

pub const WF_TURN_STARTED: &str = "wf.turn_started";
pub const WF_COMPLETED: &str = "wf.completed";
pub const WF_FAILED: &str = "wf.failed";

pub const AGENT_STARTED: &str = "agent.started";
pub const AGENT_SWITCHED: &str = "agent.switched";
pub const AGENT_DELEGATED: &str = "agent.delegated";
pub const AGENT_COMPLETED: &str = "agent.completed";
pub const AGENT_FAILED: &str = "agent.failed";
pub const AGENT_THINKING: &str = "agent.thinking";
pub const AGENT_HISTORY: &str = "agent.history";

pub const TOOL_CALL_STARTED: &str = "tool.call.started";
pub const TOOL_CALL_COMPLETED: &str = "tool.call.completed";
pub const TOOL_CALL_FAILED: &str = "tool.call.failed";
pub const TOOL_ACTION_PENDING: &str = "tool.action_pending";

pub const GATE_QUESTION_QUEUED: &str = "gate.question.queued";
pub const GATE_QUESTION_RESOLVED: &str = "gate.question.resolved";
pub const GATE_APPROVAL_QUEUED: &str = "gate.approval.queued";
pub const GATE_APPROVAL_RESOLVED: &str = "gate.approval.resolved";
pub const GATE_PLAN_APPROVAL_RESOLVED: &str = "gate.plan_approval.resolved";

pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const PLAN_READY: &str = "plan.ready";

pub const SYSTEM_HEARTBEAT: &str = "system.heartbeat";

/// Event types the Stream Projection must never forward (§4.7): terminal
/// responses are sent directly by the dispatcher to avoid duplication.
pub const STREAM_SKIPPED: &[&str] = &[WF_COMPLETED, WF_FAILED];

/// Event types the Markdown Log Projection skips as internal noise (§4.7).
pub const MARKDOWN_LOG_SKIPPED: &[&str] = &[AGENT_THINKING, AGENT_HISTORY, SYSTEM_HEARTBEAT];
