//! Gate decisions API — the human side of the Approval Bridge and gate
//! tools (`askUser`, `requestApproval`, `setChapoPlan`). Every decision
//! routes through the Command Dispatcher (§4.8) so a resolved gate always
//! produces the same terminal `response` shape a fresh chat message would.
//!
//! - `POST /v1/decisions/question` — answer a pending `UserQuestion`
//! - `POST /v1/decisions/approval` — approve/reject a pending action or gate
//! - `POST /v1/decisions/plan`     — sign off on (or request changes to) a plan

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use sa_domain::error::Error as DomainError;

use crate::runtime::dispatcher::{self, DispatchOutcome};
use crate::state::AppState;

fn outcome_response(session_key: &str, outcome: DispatchOutcome) -> axum::response::Response {
    match outcome {
        DispatchOutcome::Ran(response) => Json(serde_json::json!({
            "session_key": session_key,
            "session_id": response.session_id,
            "content": response.message,
            "pending_actions": response.pending_actions,
            "agent_history": response.agent_history,
        }))
        .into_response(),
        DispatchOutcome::Queued => Json(serde_json::json!({
            "session_key": session_key,
            "queued": true,
        }))
        .into_response(),
        DispatchOutcome::Noop => Json(serde_json::json!({
            "session_key": session_key,
        }))
        .into_response(),
    }
}

fn error_response(e: DomainError) -> axum::response::Response {
    let status = match &e {
        DomainError::GateNotFound(_) | DomainError::ActionNotFound(_) => StatusCode::NOT_FOUND,
        DomainError::InvalidTransition(_) | DomainError::ProjectRootDenied(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

fn resolve_session_id(state: &AppState, session_key: &str) -> Result<String, axum::response::Response> {
    state
        .sessions
        .get(session_key)
        .map(|entry| entry.session_id)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": format!("unknown session: {session_key}") })),
            )
                .into_response()
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/decisions/question
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct QuestionDecisionRequest {
    pub session_key: String,
    pub question_id: String,
    pub answer: String,
}

pub async fn answer_question(
    State(state): State<AppState>,
    Json(body): Json<QuestionDecisionRequest>,
) -> impl IntoResponse {
    let session_id = match resolve_session_id(&state, &body.session_key) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match dispatcher::handle_question_answered(
        &state,
        &body.session_key,
        &session_id,
        &body.question_id,
        &body.answer,
    )
    .await
    {
        Ok(outcome) => outcome_response(&body.session_key, outcome),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/decisions/approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ApprovalDecisionRequest {
    pub session_key: String,
    pub approval_id: String,
    pub approved: bool,
}

pub async fn decide_approval(
    State(state): State<AppState>,
    Json(body): Json<ApprovalDecisionRequest>,
) -> impl IntoResponse {
    let session_id = match resolve_session_id(&state, &body.session_key) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match dispatcher::handle_approval_decided(
        &state,
        &body.session_key,
        &session_id,
        &body.approval_id,
        body.approved,
        None,
    )
    .await
    {
        Ok(outcome) => outcome_response(&body.session_key, outcome),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/decisions/plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PlanDecisionRequest {
    pub session_key: String,
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

pub async fn decide_plan(
    State(state): State<AppState>,
    Json(body): Json<PlanDecisionRequest>,
) -> impl IntoResponse {
    let session_id = match resolve_session_id(&state, &body.session_key) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match dispatcher::handle_plan_approval_decided(
        &state,
        &session_id,
        body.approved,
        body.feedback.as_deref(),
    )
    .await
    {
        Ok(outcome) => outcome_response(&body.session_key, outcome),
        Err(e) => error_response(e),
    }
}
