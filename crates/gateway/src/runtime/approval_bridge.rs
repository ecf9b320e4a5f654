//! Approval Bridge (B), §4.3 — the gate every tool call passes through
//! before execution. Distinct from [`super::approval`]'s teacher-era
//! exec-only oneshot-channel mechanism: this bridge decides, for *any*
//! tool name, whether the call becomes an [`Action`] awaiting human
//! confirmation or is forwarded straight to [`super::tools::dispatch_tool`].
//!
//! Algorithm (§4.3):
//! 1. Normalize the tool name (strip a node-prefix like `node.<id>.`).
//! 2. If an agent context is present, check its `ToolPolicy` — denied
//!    tools are rejected outright, never reaching the Action Store.
//! 3. Independent permission/deny check: for `exec`-shaped calls, the
//!    command is matched against `denied_command_set` (the same
//!    compiled denylist the legacy `/v1/tools/exec` path enforces) —
//!    a match is rejected outright, same as step 2.
//! 4. Consult the confirmation policy: the tool category is checked
//!    against `ApprovalConfig.always_confirm`.
//! 5. If confirmation is required, create a `Action` (pending), persist +
//!    broadcast it, publish `tool.action_pending`, and return without
//!    executing — the caller (Turn Engine) must pause the turn.
//! 6. Otherwise, dispatch immediately and return the result.
use std::sync::Arc;

use sa_domain::error::Result;
use sa_domain::orchestration::{event_types, Action, EventVisibility, WorkflowEventEnvelope};

use crate::events::EventBus;
use crate::runtime::action_store::ActionStore;
use crate::state::AppState;

use super::agent::AgentContext;
use super::tools;

/// Outcome of running a tool call through the bridge.
pub enum BridgeOutcome {
    /// The tool ran immediately; `(content, is_error)` is the result.
    Executed { content: String, is_error: bool },
    /// The tool requires human confirmation; execution is deferred until
    /// the Command Dispatcher sees a `user_approval_decided` for this
    /// action id.
    PendingConfirmation { action: Action },
    /// The agent's tool policy denies this tool outright.
    Denied { reason: String },
}

/// Strip a `node.<id>.` prefix so policy/confirmation matching operates on
/// the logical tool name regardless of which node it is routed to.
fn normalize_tool_name(tool_name: &str) -> &str {
    if let Some(rest) = tool_name.strip_prefix("node.") {
        if let Some(idx) = rest.find('.') {
            return &rest[idx + 1..];
        }
    }
    tool_name
}

/// Extract the shell command text a call would run, for tools where that
/// concept applies (`exec`/`process`). Other tools have nothing to match
/// against the denylist and are left to the agent tool-policy check.
fn command_text(tool_name: &str, arguments: &serde_json::Value) -> Option<&str> {
    match normalize_tool_name(tool_name) {
        "exec" | "process" => arguments.get("command").and_then(|v| v.as_str()),
        _ => None,
    }
}

fn requires_confirmation(tool_name: &str, always_confirm: &[String]) -> bool {
    let name = normalize_tool_name(tool_name).to_ascii_lowercase();
    always_confirm.iter().any(|prefix| {
        let p = prefix.to_ascii_lowercase();
        name == p || name.starts_with(&format!("{p}."))
    })
}

/// Build a human-readable description/preview for the pending action from
/// the tool name and arguments, truncated to `description_max_chars`.
fn describe_action(tool_name: &str, arguments: &serde_json::Value, max_chars: usize) -> String {
    let normalized = normalize_tool_name(tool_name);
    let detail = match normalized {
        "exec" | "process" => arguments
            .get("command")
            .and_then(|v| v.as_str())
            .map(|s| format!("run `{s}`")),
        "fs_writeFile" | "fs_editFile" => arguments
            .get("path")
            .and_then(|v| v.as_str())
            .map(|s| format!("write to {s}")),
        "git" => arguments
            .get("args")
            .and_then(|v| v.as_str())
            .map(|s| format!("git {s}")),
        "ssh" => arguments
            .get("host")
            .and_then(|v| v.as_str())
            .map(|s| format!("connect to {s}")),
        "package_manager" => arguments
            .get("command")
            .and_then(|v| v.as_str())
            .map(|s| format!("package manager: {s}")),
        "workflow_trigger" => arguments
            .get("workflow")
            .and_then(|v| v.as_str())
            .map(|s| format!("trigger workflow {s}")),
        _ => None,
    };
    let mut description = detail.unwrap_or_else(|| format!("run {normalized}"));
    if description.len() > max_chars {
        description.truncate(max_chars);
        description.push_str("...");
    }
    description
}

/// Run a single tool call through the Approval Bridge.
pub async fn run(
    state: &AppState,
    tool_name: &str,
    arguments: &serde_json::Value,
    session_key: &str,
    session_id: &str,
    request_id: &str,
    turn_id: Option<&str>,
    agent: Option<&AgentContext>,
) -> Result<BridgeOutcome> {
    // Step 2: agent authorization.
    if let Some(ctx) = agent {
        if !ctx.tool_policy.allows(tool_name) {
            return Ok(BridgeOutcome::Denied {
                reason: format!("tool '{tool_name}' is not permitted for agent '{}'", ctx.agent_id),
            });
        }
    }

    // Step 3: independent permission/deny check — the same denylist the
    // legacy `/v1/tools/exec` HTTP path enforces, so a command blocked
    // there cannot execute unblocked through this path.
    if let Some(command) = command_text(tool_name, arguments) {
        if state.denied_command_set.is_match(command) {
            tracing::warn!(tool_name, command, "tool call blocked by denied_patterns");
            return Ok(BridgeOutcome::Denied {
                reason: "command blocked by security policy".to_string(),
            });
        }
    }

    // Step 4: confirmation policy.
    let always_confirm = &state.config.approval.always_confirm;
    if !requires_confirmation(tool_name, always_confirm) {
        let (content, is_error) =
            tools::dispatch_tool(state, tool_name, arguments, Some(session_key), agent).await;
        return Ok(BridgeOutcome::Executed { content, is_error });
    }

    // Step 5: create a pending Action instead of executing immediately.
    let description = describe_action(
        tool_name,
        arguments,
        state.config.approval.description_max_chars,
    );
    let mut action = Action::new(tool_name, arguments.clone(), description.clone());
    action.preview = Some(description);
    let action = state.action_store.create_action(session_key, action);

    publish_action_pending(&state.event_bus, session_id, request_id, turn_id, &action).await;

    Ok(BridgeOutcome::PendingConfirmation { action })
}

async fn publish_action_pending(
    bus: &Arc<EventBus>,
    session_id: &str,
    request_id: &str,
    turn_id: Option<&str>,
    action: &Action,
) {
    let payload = serde_json::json!({
        "action_id": action.id,
        "tool_name": action.tool_name,
        "description": action.description,
        "args": sa_domain::orchestration::sanitize_args(&action.tool_args),
    });
    bus.publish(WorkflowEventEnvelope::new(
        session_id,
        request_id,
        turn_id.map(String::from),
        "approval_bridge",
        EventVisibility::Ui,
        event_types::TOOL_ACTION_PENDING,
        payload,
    ))
    .await;
}

/// Execute an already-approved action: `approved -> executing -> {done|failed}`,
/// dispatching the underlying tool with confirmation bypassed (the Action
/// Store's state machine is now the source of truth, not the bridge).
pub async fn execute_approved_action(
    state: &AppState,
    session_key: &str,
    action_id: &str,
    agent: Option<&AgentContext>,
) -> Result<Action> {
    state.action_store.start_executing(session_key, action_id)?;
    let action = state
        .action_store
        .get(session_key, action_id)
        .ok_or_else(|| sa_domain::error::Error::ActionNotFound(action_id.to_string()))?;

    let (content, is_error) = tools::dispatch_tool(
        state,
        &action.tool_name,
        &action.tool_args,
        Some(session_key),
        agent,
    )
    .await;

    let outcome = if is_error {
        Err(content)
    } else {
        Ok(serde_json::Value::String(content))
    };
    state.action_store.finish(session_key, action_id, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_node_prefixed_tool_names() {
        assert_eq!(normalize_tool_name("node.abc123.exec"), "exec");
        assert_eq!(normalize_tool_name("exec"), "exec");
        assert_eq!(normalize_tool_name("memory.search"), "memory.search");
    }

    #[test]
    fn requires_confirmation_matches_prefix() {
        let always_confirm = vec!["fs_writeFile".to_string(), "git".to_string()];
        assert!(requires_confirmation("fs_writeFile", &always_confirm));
        assert!(requires_confirmation("git", &always_confirm));
        assert!(requires_confirmation("node.n1.git", &always_confirm));
        assert!(!requires_confirmation("memory.search", &always_confirm));
    }

    #[test]
    fn describe_action_truncates_long_descriptions() {
        let args = serde_json::json!({ "command": "x".repeat(300) });
        let desc = describe_action("exec", &args, 50);
        assert!(desc.len() <= 53);
        assert!(desc.ends_with("..."));
    }

    #[test]
    fn describe_action_falls_back_for_unknown_fields() {
        let args = serde_json::json!({});
        let desc = describe_action("exec", &args, 200);
        assert_eq!(desc, "run exec");
    }

    #[test]
    fn command_text_extracts_for_exec_and_process_only() {
        let args = serde_json::json!({ "command": "rm -rf /" });
        assert_eq!(command_text("exec", &args), Some("rm -rf /"));
        assert_eq!(command_text("node.n1.process", &args), Some("rm -rf /"));
        assert_eq!(command_text("fs_writeFile", &args), None);
    }
}
