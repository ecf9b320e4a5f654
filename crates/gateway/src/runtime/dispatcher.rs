//! Command Dispatcher (D), §4.8 — the single entry point through which
//! out-of-band human input (a new message, a gate answer, an approval
//! decision) reaches a session's conversation. Bridges the event-sourced
//! gates (Action Store / `ConversationState.pending_questions` /
//! `pending_approvals`) back into a fresh [`super::turn::run_turn`] call.
//!
//! This crate's turn loop does not resume mid-tool-call: once a gate tool
//! (`askUser`, `requestApproval`) or an Approval-Bridge confirmation pauses
//! a turn, the dispatcher answers it out-of-band (resolving the gate,
//! optionally running the now-approved action) and starts the next turn
//! with the human's reply folded into the user message, the same way a
//! human answering mid-conversation would be fed back to the model.
use sa_domain::error::{Error, Result};
use sa_domain::orchestration::{
    event_types, AgentHistoryEntry, EventVisibility, WorkflowEventEnvelope,
};
use sa_domain::orchestration::Action;
use sa_providers::ResponseFormat;

use crate::state::AppState;

use super::agent::AgentContext;
use super::approval_bridge;
use super::inbox::InboxMessage;
use super::turn::{run_turn, TurnEvent, TurnInput};

/// §6.2 terminal `response` payload: the one thing every successfully-run
/// turn produces, regardless of which entry point (chat, inbound channel,
/// gate resolution) started it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnResponse {
    pub message: String,
    pub pending_actions: Vec<Action>,
    pub session_id: String,
    pub agent_history: Vec<AgentHistoryEntry>,
}

/// What dispatching a command produced: a turn ran to completion and
/// produced a terminal response, the command was queued behind an
/// in-flight turn (§4.2), or the command doesn't itself start a turn.
#[derive(Debug)]
pub enum DispatchOutcome {
    Ran(TurnResponse),
    Queued,
    Noop,
}

/// Streaming analogue of [`DispatchOutcome`] returned by
/// [`handle_user_request_streaming`].
pub enum DispatchStreamOutcome {
    Ran(tokio::sync::mpsc::Receiver<TurnEvent>),
    Queued,
}

/// If a turn is already running for this session, queue the message in the
/// Inbox (§4.2) instead of starting a second concurrent turn; the next turn
/// boundary drains it. Otherwise runs a new turn to completion and returns
/// its terminal response (§4.8: the dispatcher is the sole producer of the
/// terminal response and the sole owner of validating `projectRoot`).
pub async fn handle_user_request(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    message: &str,
    model: Option<String>,
    response_format: Option<ResponseFormat>,
    routing_profile: Option<sa_domain::config::RoutingProfile>,
    agent: Option<AgentContext>,
    project_root: Option<&str>,
) -> Result<DispatchOutcome> {
    validate_project_root(state, project_root)?;

    if let Some(outcome) = enter_turn(state, session_key, session_id, message).await? {
        return Ok(outcome);
    }

    let response = run_and_collect(
        state,
        session_key,
        session_id,
        message,
        model,
        response_format,
        agent,
        routing_profile,
    )
    .await?;
    Ok(DispatchOutcome::Ran(response))
}

/// Streaming counterpart of [`handle_user_request`] for `/v1/chat/stream`:
/// performs the same `projectRoot` validation and Inbox-queueing check, but
/// hands back the live `TurnEvent` receiver instead of collecting it into a
/// terminal response, so the caller can forward deltas to the client as they
/// arrive.
pub async fn handle_user_request_streaming(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    message: &str,
    model: Option<String>,
    response_format: Option<ResponseFormat>,
    routing_profile: Option<sa_domain::config::RoutingProfile>,
    agent: Option<AgentContext>,
    project_root: Option<&str>,
) -> Result<DispatchStreamOutcome> {
    validate_project_root(state, project_root)?;

    if enter_turn(state, session_key, session_id, message).await?.is_some() {
        return Ok(DispatchStreamOutcome::Queued);
    }

    let input = TurnInput {
        session_key: session_key.to_string(),
        session_id: session_id.to_string(),
        user_message: message.to_string(),
        model,
        response_format,
        agent,
        routing_profile,
    };
    let (_run_id, rx) = run_turn(state.clone(), input);
    Ok(DispatchStreamOutcome::Ran(rx))
}

fn validate_project_root(state: &AppState, project_root: Option<&str>) -> Result<()> {
    if let Some(root) = project_root {
        if !state
            .config
            .workspace
            .is_project_root_allowed(std::path::Path::new(root))
        {
            return Err(Error::ProjectRootDenied(root.to_string()));
        }
    }
    Ok(())
}

/// Shared `user_request` entry logic (§4.8): if a turn is already running for
/// this session, queue the message in the Inbox (§4.2) instead of starting a
/// second concurrent turn and report back so the caller can short-circuit;
/// otherwise mark the loop running and return `None` so the caller proceeds
/// to start the turn itself.
async fn enter_turn(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    message: &str,
) -> Result<Option<DispatchOutcome>> {
    state.conversation_store.ensure_loaded(session_id).await?;
    let is_running = state
        .conversation_store
        .get(session_id)
        .map(|s| s.is_loop_running)
        .unwrap_or(false);

    if is_running {
        state.inbox.push(InboxMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            payload: serde_json::json!({ "message": message }),
        });
        return Ok(Some(DispatchOutcome::Queued));
    }

    state.conversation_store.update(session_id, |s| {
        s.is_loop_running = true;
    })?;
    state.conversation_store.schedule_flush(session_id.to_string());
    Ok(None)
}

/// Resolve a pending `UserQuestion` (§4.5.1) and resume the conversation
/// with the human's answer.
pub async fn handle_question_answered(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    question_id: &str,
    answer: &str,
) -> Result<DispatchOutcome> {
    state.conversation_store.ensure_loaded(session_id).await?;
    let found = state
        .conversation_store
        .get(session_id)
        .map(|s| s.pending_questions.iter().any(|q| q.question_id == question_id))
        .unwrap_or(false);
    if !found {
        return Err(Error::GateNotFound(question_id.to_string()));
    }

    // Dequeue the resolved question. This is the only place this happens —
    // projections observe GATE_QUESTION_RESOLVED for audit only.
    state.conversation_store.update(session_id, |s| {
        s.pending_questions.retain(|q| q.question_id != question_id);
    })?;

    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            session_id,
            uuid::Uuid::new_v4().to_string(),
            None,
            "dispatcher",
            EventVisibility::Ui,
            event_types::GATE_QUESTION_RESOLVED,
            serde_json::json!({ "question_id": question_id, "answer": answer }),
        ))
        .await;

    let message = format!("[answer to question {question_id}]: {answer}");
    resume_turn(state, session_key, session_id, &message, None).await
}

/// Resolve a pending approval. The Action Store (confirmation-gated tool
/// calls, §4.4) is checked first — a decision there executes or discards
/// the underlying tool call directly. If no matching action exists, falls
/// back to a gate-level `ApprovalRequest` (§4.5.2), which only carries the
/// human's decision back into the conversation as text.
pub async fn handle_approval_decided(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    approval_id: &str,
    approved: bool,
    agent: Option<&AgentContext>,
) -> Result<DispatchOutcome> {
    if let Some(action) = state.action_store.get(session_key, approval_id) {
        let message = if approved {
            state.action_store.approve(session_key, approval_id)?;
            let executed = approval_bridge::execute_approved_action(state, session_key, approval_id, agent).await?;
            format!(
                "[action \"{}\" approved and executed]: {}",
                executed.description,
                executed.result.clone().unwrap_or_default()
            )
        } else {
            state.action_store.reject_action(session_key, approval_id)?;
            format!("[action \"{}\" rejected by user]", action.description)
        };
        return resume_turn(state, session_key, session_id, &message, None).await;
    }

    state.conversation_store.ensure_loaded(session_id).await?;
    let found = state
        .conversation_store
        .get(session_id)
        .map(|s| s.pending_approvals.iter().any(|a| a.approval_id == approval_id))
        .unwrap_or(false);
    if !found {
        return Err(Error::GateNotFound(approval_id.to_string()));
    }

    // Dequeue the resolved approval. This is the only place this happens —
    // projections observe GATE_APPROVAL_RESOLVED for audit only.
    state.conversation_store.update(session_id, |s| {
        s.pending_approvals.retain(|a| a.approval_id != approval_id);
    })?;

    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            session_id,
            uuid::Uuid::new_v4().to_string(),
            None,
            "dispatcher",
            EventVisibility::Ui,
            event_types::GATE_APPROVAL_RESOLVED,
            serde_json::json!({ "approval_id": approval_id, "approved": approved }),
        ))
        .await;

    let message = if approved {
        format!("[approval {approval_id} granted]")
    } else {
        format!("[approval {approval_id} denied]")
    };
    resume_turn(state, session_key, session_id, &message, None).await
}

/// Resolve a plan-approval decision raised by `setChapoPlan` (§4.5.5).
/// Unlike question/approval gates, this does not itself pause the turn
/// loop (the plan tool returns immediately) — it only records the human's
/// sign-off for downstream consumers (dashboards, audit).
pub async fn handle_plan_approval_decided(
    state: &AppState,
    session_id: &str,
    approved: bool,
    feedback: Option<&str>,
) -> Result<DispatchOutcome> {
    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            session_id,
            uuid::Uuid::new_v4().to_string(),
            None,
            "dispatcher",
            EventVisibility::Ui,
            event_types::GATE_PLAN_APPROVAL_RESOLVED,
            serde_json::json!({ "approved": approved, "feedback": feedback }),
        ))
        .await;
    Ok(DispatchOutcome::Noop)
}

/// Resume a session whose turn previously paused at a gate: mark the loop
/// running again and run a fresh turn with the gate's resolution folded in
/// as the user message, exactly as a human reply mid-conversation would be.
async fn resume_turn(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    message: &str,
    agent: Option<AgentContext>,
) -> Result<DispatchOutcome> {
    state.conversation_store.update(session_id, |s| {
        s.is_loop_running = true;
    })?;
    state.conversation_store.schedule_flush(session_id.to_string());

    let response =
        run_and_collect(state, session_key, session_id, message, None, None, agent, None).await?;
    Ok(DispatchOutcome::Ran(response))
}

/// Run a turn to completion, draining its event stream into the §6.2
/// terminal `response` payload instead of discarding it. Message persistence
/// (both the user and assistant transcript entries) and the `wf.completed`
/// event are handled by the Turn Engine itself (`run_turn`); this only
/// collects what the Turn Engine already produced into the dispatcher's
/// single terminal response shape.
async fn run_and_collect(
    state: &AppState,
    session_key: &str,
    session_id: &str,
    message: &str,
    model: Option<String>,
    response_format: Option<ResponseFormat>,
    agent: Option<AgentContext>,
    routing_profile: Option<sa_domain::config::RoutingProfile>,
) -> Result<TurnResponse> {
    let input = TurnInput {
        session_key: session_key.to_string(),
        session_id: session_id.to_string(),
        user_message: message.to_string(),
        model,
        response_format,
        agent,
        routing_profile,
    };
    let (_run_id, mut rx) = run_turn(state.clone(), input);

    let mut reply = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Final { content } | TurnEvent::Stopped { content } => reply = content,
            TurnEvent::Error { message } => reply = format!("[error]: {message}"),
            _ => { /* deltas/tool activity: consumed via StreamProjection, not the terminal response */ }
        }
    }

    let pending_actions = state.action_store.pending_for_session(session_key);
    let agent_history = state
        .conversation_store
        .get(session_id)
        .map(|s| s.agent_history)
        .unwrap_or_default();

    Ok(TurnResponse {
        message: reply,
        pending_actions,
        session_id: session_id.to_string(),
        agent_history,
    })
}
