use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.llm.list_providers();
    Json(serde_json::json!({
        "providers": providers,
        "count": providers.len(),
    }))
}

pub async fn list_roles(State(state): State<AppState>) -> impl IntoResponse {
    let roles = state.llm.list_roles();
    Json(serde_json::json!({
        "roles": roles,
    }))
}

/// Public readiness probe: which providers initialized successfully, and
/// why any configured provider that failed to initialize did so (secrets
/// masked). Lets health probes and the dashboard tell "booted with no
/// usable LLM" apart from "fully down".
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let errors: Vec<serde_json::Value> = state
        .llm
        .init_errors()
        .iter()
        .map(|e| {
            serde_json::json!({
                "provider_id": e.provider_id,
                "kind": e.kind,
                "error": e.error,
            })
        })
        .collect();

    Json(serde_json::json!({
        "ready": !state.llm.is_empty(),
        "providers": state.llm.list_providers(),
        "init_errors": errors,
    }))
}
