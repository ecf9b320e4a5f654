//! Turn execution loop — the inner orchestrator that streams LLM
//! responses, dispatches tool calls, and tracks run state.
//!
//! Entry point: [`run_turn`] spawns the async loop and returns a
//! channel of [`TurnEvent`]s.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use sa_domain::orchestration::{
    event_types, preflight_answer, AgentKind, ApprovalRequest, EventVisibility, Plan, PlanStep,
    RiskLevel, StepOwner, StepStatus, UserQuestion, WorkflowEventEnvelope,
};
use sa_domain::stream::{StreamEvent, Usage};
use sa_domain::tool::{Message, ToolCall, ToolDefinition};

use crate::state::AppState;

use super::agent;
use super::approval_bridge;
use super::cancel::CancelToken;
use super::compact;
use super::runs;
use super::tools;
use super::{
    build_assistant_tool_message, build_system_context, fire_auto_capture, load_raw_transcript,
    persist_transcript, resolve_provider, resolve_summarizer, transcript_lines_to_messages,
    truncate_str,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnContext — pre-built state for one turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the tool loop needs, built once before the first LLM call.
pub(super) struct TurnContext {
    provider: Arc<dyn sa_providers::LlmProvider>,
    messages: Vec<Message>,
    tool_defs: Arc<Vec<ToolDefinition>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent — the SSE event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during a single agent turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    /// Reasoning/thinking content from the model.
    #[serde(rename = "thought")]
    Thought { content: String },

    /// Incremental text from the assistant.
    #[serde(rename = "assistant_delta")]
    AssistantDelta { text: String },

    /// The model is invoking a tool.
    #[serde(rename = "tool_call")]
    ToolCallEvent {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Tool execution result.
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// The final assistant message (full text).
    #[serde(rename = "final")]
    Final { content: String },

    /// The turn was stopped by a cancellation request.
    #[serde(rename = "stopped")]
    Stopped {
        /// Partial content accumulated before the stop.
        content: String,
    },

    /// An error occurred.
    #[serde(rename = "error")]
    Error { message: String },

    /// Token usage for the turn.
    #[serde(rename = "usage")]
    UsageEvent {
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to a single turn.
pub struct TurnInput {
    pub session_key: String,
    pub session_id: String,
    pub user_message: String,
    /// Model override (e.g. "openai/gpt-4o"). None = use role default.
    pub model: Option<String>,
    /// Controls the response format (text, json_object, json_schema).
    pub response_format: Option<sa_providers::ResponseFormat>,
    /// When running as a sub-agent, carries agent-scoped overrides.
    pub agent: Option<agent::AgentContext>,
    /// Smart router profile override. `None` defers to the router's
    /// configured default (or bypasses the router entirely if disabled).
    pub routing_profile: Option<sa_domain::config::RoutingProfile>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn — the core orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one agent turn: build context, call LLM, dispatch tools, loop.
///
/// Returns the `run_id` (UUID) and a channel receiver of [`TurnEvent`]s
/// (the caller reads events as they arrive for SSE streaming, or drains
/// them for non-streaming).
///
/// Registers a cancel token so `POST /v1/sessions/:key/stop` can abort
/// the turn cleanly.
pub fn run_turn(
    state: AppState,
    input: TurnInput,
) -> (uuid::Uuid, mpsc::Receiver<TurnEvent>) {
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);

    // ── Create run record ────────────────────────────────────────
    let mut run = runs::Run::new(
        input.session_key.clone(),
        input.session_id.clone(),
        &input.user_message,
    );
    run.model = input.model.clone();
    run.agent_id = input.agent.as_ref().map(|a| a.agent_id.clone());
    run.status = runs::RunStatus::Running;
    let run_id = run.run_id;
    state.run_store.insert(run);
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Running,
        },
    );

    // Register a cancel token for this session.
    let cancel_token = state.cancel_map.register(&input.session_key);
    let session_key = input.session_key.clone();
    let session_id = input.session_id.clone();
    let state_ref = state;

    let turn_span = tracing::info_span!(
        "turn",
        %run_id,
        session_key = %session_key,
        "otel.kind" = "SERVER",
    );
    tokio::spawn(tracing::Instrument::instrument(async move {
        tracing::debug!("turn started");
        state_ref
            .event_bus
            .publish(WorkflowEventEnvelope::new(
                &session_id,
                run_id.to_string(),
                Some(run_id.to_string()),
                "turn_engine",
                EventVisibility::Internal,
                event_types::WF_TURN_STARTED,
                serde_json::json!({ "session_key": session_key }),
            ))
            .await;

        let result =
            run_turn_inner(state_ref.clone(), input, tx.clone(), &cancel_token, run_id).await;

        // Cleanup: remove the cancel token.
        state_ref.cancel_map.remove(&session_key);

        if let Err(e) = result {
            let err_msg = e.to_string();
            state_ref.run_store.update(&run_id, |r| {
                r.error = Some(err_msg.clone());
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state_ref.run_store.get(&run_id) {
                state_ref.run_store.persist(&run);
            }
            state_ref.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state_ref.run_store.cleanup_channel(&run_id);
            state_ref
                .event_bus
                .publish(WorkflowEventEnvelope::new(
                    &session_id,
                    run_id.to_string(),
                    Some(run_id.to_string()),
                    "turn_engine",
                    EventVisibility::Internal,
                    event_types::WF_FAILED,
                    serde_json::json!({ "error": err_msg }),
                ))
                .await;
            let _ = tx
                .send(TurnEvent::Error {
                    message: err_msg,
                })
                .await;
        }

        complete_turn_loop(&state_ref, &session_key, &session_id).await;
    }, turn_span));

    (run_id, rx)
}

/// §3/§8: `isLoopRunning` must never survive past the turn that set it,
/// success or failure. Resets the flag and, if the Inbox (§4.2) collected
/// any messages while this turn was running, folds them into a follow-up
/// turn (§4.5.1 step 7) rather than leaving them stranded.
async fn complete_turn_loop(state: &AppState, session_key: &str, session_id: &str) {
    if let Err(e) = state.conversation_store.update(session_id, |s| {
        s.is_loop_running = false;
        s.active_turn_id = None;
    }) {
        tracing::warn!(session_id, error = %e, "failed to clear is_loop_running after turn");
        return;
    }
    if let Err(e) = state.conversation_store.flush_now(session_id).await {
        tracing::warn!(session_id, error = %e, "failed to flush conversation state after turn");
    }

    let queued = state.inbox.drain(session_key);
    if queued.is_empty() {
        return;
    }
    let message = queued
        .iter()
        .filter_map(|m| m.payload.get("message").and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join("\n");
    if message.is_empty() {
        return;
    }

    if let Err(e) = state.conversation_store.update(session_id, |s| {
        s.is_loop_running = true;
    }) {
        tracing::warn!(session_id, error = %e, "failed to mark follow-up turn running");
        return;
    }
    state.conversation_store.schedule_flush(session_id.to_string());

    let input = TurnInput {
        session_key: session_key.to_string(),
        session_id: session_id.to_string(),
        user_message: message,
        model: None,
        response_format: None,
        agent: None,
        routing_profile: None,
    };
    let (_run_id, mut rx) = run_turn(state.clone(), input);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extracted helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle a cancellation event: update the run store, persist a
/// transcript marker, and send a [`TurnEvent::Stopped`] to the caller.
///
/// Used by the streaming and tool-dispatch cancellation sites.
async fn handle_cancellation(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    session_id: &str,
    run_id: uuid::Uuid,
    partial_content: &str,
    context_msg: &str,
) {
    state.run_store.update(&run_id, |r| {
        r.output_preview = Some(truncate_str(partial_content, 200));
        r.finish(runs::RunStatus::Stopped);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Stopped,
        },
    );
    state.run_store.cleanup_channel(&run_id);
    persist_transcript(
        &state.transcripts,
        session_id,
        "system",
        &format!(
            "[run aborted by user{context_msg}]{}",
            if partial_content.is_empty() {
                String::new()
            } else {
                format!(" partial: {partial_content}")
            }
        ),
        Some(serde_json::json!({ "stopped": true })),
        Some(state.sessions.search_index()),
    )
    .await;
    let _ = tx
        .send(TurnEvent::Stopped {
            content: partial_content.to_string(),
        })
        .await;
}

/// Finalize a successful run: persist the assistant transcript, send
/// Final + Usage events, record usage in the session store, update and
/// persist the run, emit completion events, and fire auto-capture.
async fn finalize_run_success(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    input: &TurnInput,
    run_id: uuid::Uuid,
    text_buf: &str,
    total_usage: &Usage,
) {
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "assistant",
        text_buf,
        None,
        Some(state.sessions.search_index()),
    )
    .await;

    let _ = tx
        .send(TurnEvent::Final {
            content: text_buf.to_string(),
        })
        .await;

    let _ = tx
        .send(TurnEvent::UsageEvent {
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            total_tokens: total_usage.total_tokens,
        })
        .await;

    state.sessions.record_usage(
        &input.session_key,
        total_usage.prompt_tokens as u64,
        total_usage.completion_tokens as u64,
    );
    // Track live context-window occupancy (§4.5.3) so the next turn's
    // compaction check can compare against `compaction_token_threshold` /
    // `compaction_pct_threshold` without re-walking the transcript.
    state
        .sessions
        .set_context_tokens(&input.session_key, total_usage.total_tokens as u64);

    // ── Finalize run (success) ───────────────────────────
    let pricing_map = &state.config.llm.pricing;
    state.run_store.update(&run_id, |r| {
        r.input_tokens = total_usage.prompt_tokens;
        r.output_tokens = total_usage.completion_tokens;
        r.total_tokens = total_usage.total_tokens;
        r.output_preview = Some(truncate_str(text_buf, 200));
        // Compute estimated cost from per-model pricing config.
        if let Some(model_name) = r.model.as_deref() {
            if let Some(pricing) = pricing_map.get(model_name) {
                r.estimated_cost_usd =
                    pricing.estimate_cost(total_usage.prompt_tokens, total_usage.completion_tokens);
            }
        }
        r.finish(runs::RunStatus::Completed);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Completed,
        },
    );
    state.run_store.emit(
        &run_id,
        runs::RunEvent::Usage {
            run_id,
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            total_tokens: total_usage.total_tokens,
        },
    );
    state.run_store.cleanup_channel(&run_id);

    // ── Record usage against quota tracker ─────────────────
    {
        let estimated_cost = state
            .run_store
            .get(&run_id)
            .map(|r| r.estimated_cost_usd)
            .unwrap_or(0.0);
        state.quota_tracker.record_usage(
            input.agent.as_ref().map(|a| a.agent_id.as_str()),
            total_usage.total_tokens as u64,
            estimated_cost,
        );
    }

    // ── Memory auto-capture (fire-and-forget) ─────────────
    fire_auto_capture(state, input, text_buf);

    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            run_id.to_string(),
            Some(run_id.to_string()),
            "turn_engine",
            EventVisibility::Internal,
            event_types::WF_COMPLETED,
            serde_json::json!({ "total_tokens": total_usage.total_tokens }),
        ))
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn_inner — the main tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_inner(
    state: AppState,
    input: TurnInput,
    tx: mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
    run_id: uuid::Uuid,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut node_seq: u32 = 0;

    // ── Pre-flight: quota check ─────────────────────────────────────────
    {
        let agent_id = input.agent.as_ref().map(|a| a.agent_id.as_str());
        if let Err(exceeded) = state.quota_tracker.check_quota(agent_id) {
            let msg = format!(
                "daily {} quota exceeded: {:.2}/{:.2}",
                exceeded.kind, exceeded.used, exceeded.limit,
            );
            let _ = tx.send(TurnEvent::Error { message: msg }).await;
            state.run_store.update(&run_id, |r| {
                r.error = Some(format!("quota exceeded: {}", exceeded.kind));
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state.run_store.cleanup_channel(&run_id);
            return Ok(());
        }
    }

    // ── Phase 1: Build the turn context (provider, messages, tool defs) ──
    let ctx = prepare_turn_context(&state, &input).await?;
    let TurnContext {
        provider,
        mut messages,
        tool_defs,
    } = ctx;

    // ── Phase 2: Tool loop ───────────────────────────────────────────────
    let mut total_usage = Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    };

    // Sub-agents are bounded by their own `maxTurns` (§4.6); the primary
    // CHAPO turn uses the configured general-purpose loop cap (§4.5, `TurnConfig::max_loops`).
    let loop_limit = input
        .agent
        .as_ref()
        .map(|a| a.max_turns as usize)
        .unwrap_or(state.config.turn.max_loops as usize)
        .max(1);

    for loop_idx in 0..loop_limit {
        tracing::debug!(loop_idx, "tool loop iteration");
        // ── Check cancellation before each LLM call ──────────────
        // (lightweight: no run-store update since we haven't started yet)
        if cancel.is_cancelled() {
            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "system",
                "[run aborted by user]",
                Some(serde_json::json!({ "stopped": true })),
                Some(state.sessions.search_index()),
            )
            .await;
            let _ = tx
                .send(TurnEvent::Stopped {
                    content: String::new(),
                })
                .await;
            return Ok(());
        }

        // ── Track LLM node ────────────────────────────────────────
        node_seq += 1;
        let llm_node_id = node_seq;
        let llm_start = chrono::Utc::now();
        let llm_node = runs::RunNode {
            node_id: llm_node_id,
            kind: runs::NodeKind::LlmRequest,
            name: "llm".into(),
            status: runs::RunStatus::Running,
            started_at: llm_start,
            ended_at: None,
            duration_ms: None,
            input_preview: None,
            output_preview: None,
            is_error: false,
            input_tokens: 0,
            output_tokens: 0,
        };
        state.run_store.update(&run_id, |r| {
            r.loop_count = loop_idx as u32 + 1;
            r.nodes.push(llm_node.clone());
        });
        state.run_store.emit(
            &run_id,
            runs::RunEvent::NodeStarted {
                run_id,
                node: llm_node,
            },
        );

        // Call LLM (streaming).
        let req = sa_providers::ChatRequest {
            messages: messages.clone(),
            tools: (*tool_defs).clone(),
            temperature: Some(0.2),
            max_tokens: None,
            response_format: input
                .response_format
                .clone()
                .unwrap_or_default(),
            model: input.model.clone(),
        };

        let llm_call_span = tracing::info_span!(
            "llm.call",
            "otel.kind" = "CLIENT",
            model = req.model.as_deref().unwrap_or("default"),
            input_tokens = tracing::field::Empty,
            output_tokens = tracing::field::Empty,
        );

        // Enter the span for the entire LLM interaction (connect + stream
        // consumption + token recording) so OTel captures the full duration.
        let _llm_guard = llm_call_span.enter();

        let mut stream = provider.chat_stream(&req).await?;

        // Accumulate the response.
        let mut text_buf = String::new();
        let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
        let mut turn_usage: Option<Usage> = None;
        let mut was_cancelled = false;

        // Tool call assembly state.
        let mut tc_bufs: std::collections::HashMap<String, (String, String)> =
            std::collections::HashMap::new(); // call_id -> (name, args_json)

        while let Some(event_result) = stream.next().await {
            // Check cancellation during streaming.
            if cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }

            let event = event_result?;
            match event {
                StreamEvent::Thinking { text } => {
                    let _ = tx
                        .send(TurnEvent::Thought { content: text })
                        .await;
                }
                StreamEvent::Token { text } => {
                    let _ = tx
                        .send(TurnEvent::AssistantDelta { text: text.clone() })
                        .await;
                    text_buf.push_str(&text);
                }
                StreamEvent::ToolCallStarted {
                    call_id,
                    tool_name,
                } => {
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    pending_tool_calls.push(ToolCall {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: arguments.clone(),
                    });
                    tc_bufs.remove(&call_id);
                }
                StreamEvent::Done {
                    usage,
                    finish_reason: _,
                } => {
                    turn_usage = usage;
                }
                StreamEvent::Error { message } => {
                    let _ = tx.send(TurnEvent::Error { message }).await;
                    return Ok(());
                }
            }
        }

        // Record token usage while the span is still entered.
        if let Some(u) = &turn_usage {
            llm_call_span.record("input_tokens", u.prompt_tokens);
            llm_call_span.record("output_tokens", u.completion_tokens);
        }

        // Close the llm.call span — duration now covers the full streaming interaction.
        drop(_llm_guard);

        // ── Finalize LLM node ─────────────────────────────────────
        {
            let llm_end = chrono::Utc::now();
            let llm_dur = (llm_end - llm_start).num_milliseconds().max(0) as u64;
            let llm_status = if was_cancelled {
                runs::RunStatus::Stopped
            } else {
                runs::RunStatus::Completed
            };
            let t_in = turn_usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
            let t_out = turn_usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0);
            state.run_store.update(&run_id, |r| {
                if let Some(n) = r.nodes.iter_mut().find(|n| n.node_id == llm_node_id) {
                    n.status = llm_status;
                    n.ended_at = Some(llm_end);
                    n.duration_ms = Some(llm_dur);
                    n.input_tokens = t_in;
                    n.output_tokens = t_out;
                    n.output_preview = Some(truncate_str(&text_buf, 200));
                }
            });
        }

        // Handle cancellation during streaming.
        if was_cancelled {
            handle_cancellation(&state, &tx, &input.session_id, run_id, &text_buf, "").await;
            return Ok(());
        }

        // Assemble any tool calls that came through start/delta but not
        // through ToolCallFinished (some providers only use start+delta).
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = if args_str.trim().is_empty() {
                // Empty arguments (common with DeepSeek) → default to empty object.
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&args_str) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    }
                }
            };
            pending_tool_calls.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        // Accumulate usage.
        if let Some(u) = &turn_usage {
            total_usage.prompt_tokens += u.prompt_tokens;
            total_usage.completion_tokens += u.completion_tokens;
            total_usage.total_tokens += u.total_tokens;
        }

        // If no tool calls, this is the final answer.
        if pending_tool_calls.is_empty() {
            finalize_run_success(&state, &tx, &input, run_id, &text_buf, &total_usage).await;
            return Ok(());
        }

        // ── Tool dispatch ──────────────────────────────────────────
        messages.push(build_assistant_tool_message(&text_buf, &pending_tool_calls));

        let tc_json = serde_json::to_string(&pending_tool_calls).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize tool calls for transcript");
            String::new()
        });
        persist_transcript(
            &state.transcripts,
            &input.session_id,
            "assistant",
            &text_buf,
            Some(serde_json::json!({ "tool_calls": tc_json })),
            Some(state.sessions.search_index()),
        )
        .await;

        // 1. Emit all ToolCallEvents and create run nodes.
        let mut tool_node_info: Vec<(u32, chrono::DateTime<chrono::Utc>)> = Vec::new();
        for tc in &pending_tool_calls {
            // Check cancellation before each tool.
            if cancel.is_cancelled() {
                handle_cancellation(
                    &state,
                    &tx,
                    &input.session_id,
                    run_id,
                    &text_buf,
                    " during tool dispatch",
                )
                .await;
                return Ok(());
            }

            // ── Track tool node ────────────────────────────────
            node_seq += 1;
            let tool_node_id = node_seq;
            let tool_start = chrono::Utc::now();
            let tool_input_preview = serde_json::to_string(&tc.arguments)
                .ok()
                .map(|s| truncate_str(&s, 200));
            let tool_node = runs::RunNode {
                node_id: tool_node_id,
                kind: runs::NodeKind::ToolCall,
                name: tc.tool_name.clone(),
                status: runs::RunStatus::Running,
                started_at: tool_start,
                ended_at: None,
                duration_ms: None,
                input_preview: tool_input_preview,
                output_preview: None,
                is_error: false,
                input_tokens: 0,
                output_tokens: 0,
            };
            state.run_store.update(&run_id, |r| {
                r.nodes.push(tool_node.clone());
            });
            state.run_store.emit(
                &run_id,
                runs::RunEvent::NodeStarted {
                    run_id,
                    node: tool_node,
                },
            );
            tool_node_info.push((tool_node_id, tool_start));

            let _ = tx
                .send(TurnEvent::ToolCallEvent {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .await;

            state
                .event_bus
                .publish(WorkflowEventEnvelope::new(
                    &input.session_id,
                    run_id.to_string(),
                    Some(run_id.to_string()),
                    "turn_engine",
                    EventVisibility::Internal,
                    event_types::TOOL_CALL_STARTED,
                    serde_json::json!({
                        "call_id": tc.call_id,
                        "tool_name": tc.tool_name,
                    }),
                ))
                .await;
        }

        // 2. Check cancellation once before the batch.
        if cancel.is_cancelled() {
            handle_cancellation(
                &state,
                &tx,
                &input.session_id,
                run_id,
                &text_buf,
                " during tool dispatch",
            )
            .await;
            return Ok(());
        }

        // 3. Dispatch all tools concurrently.
        //    Latency = max(tool_latencies) instead of sum(tool_latencies).
        //    Results are collected in original order via join_all to preserve
        //    deterministic SSE sequencing. Gate tools (askUser/requestApproval)
        //    and tools awaiting confirmation (Approval Bridge) signal `pause`;
        //    ordinary tools go through `approval_bridge::run`, which dispatches
        //    immediately unless the tool category requires confirmation.
        let turn_id_str = run_id.to_string();
        let tool_futures: Vec<_> = pending_tool_calls
            .iter()
            .map(|tc| {
                let tool_span = tracing::info_span!(
                    "tool.call",
                    tool_name = %tc.tool_name,
                );
                execute_tool_call(&state, tc, &input, &turn_id_str).instrument(tool_span)
            })
            .collect();
        let tool_outcomes = futures_util::future::join_all(tool_futures).await;

        // 4. Emit results, finalize nodes, and persist transcripts.
        let mut should_pause = false;
        let mut escalation: Option<String> = None;
        for ((tc, outcome), (tool_node_id, tool_start)) in
            pending_tool_calls.iter().zip(tool_outcomes).zip(tool_node_info)
        {
            let ToolOutcome {
                content: result_content,
                is_error,
                pause,
                escalated,
            } = outcome;
            should_pause |= pause;
            if escalation.is_none() {
                escalation = escalated;
            }

            // ── Finalize tool node ───────────────────────────────
            let tool_end = chrono::Utc::now();
            let tool_dur = (tool_end - tool_start).num_milliseconds().max(0) as u64;
            let tool_status = if is_error {
                runs::RunStatus::Failed
            } else {
                runs::RunStatus::Completed
            };
            state.run_store.update(&run_id, |r| {
                if let Some(n) = r.nodes.iter_mut().find(|n| n.node_id == tool_node_id) {
                    n.status = tool_status;
                    n.ended_at = Some(tool_end);
                    n.duration_ms = Some(tool_dur);
                    n.output_preview = Some(truncate_str(&result_content, 200));
                    n.is_error = is_error;
                }
            });

            let _ = tx
                .send(TurnEvent::ToolResult {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    content: result_content.clone(),
                    is_error,
                })
                .await;

            state
                .event_bus
                .publish(WorkflowEventEnvelope::new(
                    &input.session_id,
                    turn_id_str.clone(),
                    Some(turn_id_str.clone()),
                    "turn_engine",
                    EventVisibility::Internal,
                    if is_error {
                        event_types::TOOL_CALL_FAILED
                    } else {
                        event_types::TOOL_CALL_COMPLETED
                    },
                    serde_json::json!({
                        "call_id": tc.call_id,
                        "tool_name": tc.tool_name,
                    }),
                ))
                .await;

            messages.push(Message::tool_result(&tc.call_id, &result_content));

            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "tool",
                &result_content,
                Some(serde_json::json!({
                    "call_id": tc.call_id,
                    "tool_name": tc.tool_name,
                    "is_error": is_error,
                })),
                Some(state.sessions.search_index()),
            )
            .await;
        }

        if let Some(reason) = escalation {
            // `escalateToChapo` (§4.5.2) — exit this sub-agent turn immediately;
            // the Sub-Agent Runner (`agent::run_agent`) surfaces this `Final`
            // content as the escalated exit reason (§4.6).
            let _ = state.conversation_store.flush_now(&input.session_id).await;
            let _ = tx
                .send(TurnEvent::Final {
                    content: format!("escalated to chapo: {reason}"),
                })
                .await;
            return Ok(());
        }

        if should_pause {
            // A gate tool (askUser/requestApproval) or an Approval-Bridge
            // confirmation is now pending; the Command Dispatcher resumes
            // this conversation once the human responds (§4.8).
            let _ = state.conversation_store.flush_now(&input.session_id).await;
            return Ok(());
        }

        if loop_idx == loop_limit - 1 {
            let message = if input.agent.is_some() {
                format!("max_turns reached ({loop_limit})")
            } else {
                format!("tool loop limit reached ({loop_limit} iterations)")
            };
            let _ = tx.send(TurnEvent::Error { message }).await;
        }
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase 1 helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Phase 1: Resolve the provider, build the system prompt, load and
/// compact the transcript, assemble messages, and persist the user turn.
///
/// Returns a [`TurnContext`] containing everything the tool loop needs.
async fn prepare_turn_context(
    state: &AppState,
    input: &TurnInput,
) -> Result<TurnContext, Box<dyn std::error::Error + Send + Sync>> {
    // 1. Resolve the LLM provider (agent models -> global roles -> any).
    let provider = resolve_provider(
        state,
        input.model.as_deref(),
        input.agent.as_ref(),
        input.routing_profile,
    )?;

    // 2. Build system context (agent-scoped workspace/skills if present).
    let system_prompt = build_system_context(state, input.agent.as_ref()).await;

    // 3. Load raw transcript and check compaction.
    //    Child agents have compaction disabled by default (short-lived sessions).
    let mut all_lines = load_raw_transcript(&state.transcripts, &input.session_id);

    let compaction_enabled = input
        .agent
        .as_ref()
        .map_or(state.config.compaction.auto, |a| a.compaction_enabled);

    // Compute the compaction boundary once to avoid redundant reverse scans.
    let mut boundary = compact::compaction_boundary(&all_lines);

    // Freeze the original user request once per session (§3 TaskContext,
    // §4.5.3 "freeze the original user request text (pinned)") so
    // compaction has something to pin — idempotent, only set if absent.
    let _ = state.conversation_store.ensure_loaded(&input.session_id).await;
    let needs_freeze = state
        .conversation_store
        .get(&input.session_id)
        .map(|s| s.task_context.original_request.is_none())
        .unwrap_or(true);
    if needs_freeze {
        let original = input.user_message.clone();
        let _ = state
            .conversation_store
            .update(&input.session_id, |s| {
                s.task_context.original_request = Some(original);
            });
    }
    let original_request = state
        .conversation_store
        .get(&input.session_id)
        .and_then(|s| s.task_context.original_request.clone());

    let tracked_context_tokens = state
        .sessions
        .get(&input.session_key)
        .map(|e| e.context_tokens)
        .unwrap_or(0);
    let context_window_tokens = provider.capabilities().context_window_tokens;

    if compaction_enabled
        && (compact::should_compact_with_boundary(&all_lines, &state.config.compaction, boundary)
            || compact::should_compact_for_tokens(
                tracked_context_tokens,
                context_window_tokens,
                &state.config.turn,
            ))
    {
        // Pick the summarizer (or fall back to the executor provider).
        let summarizer = resolve_summarizer(state).unwrap_or_else(|| provider.clone());
        match compact::run_compaction(
            summarizer.as_ref(),
            &state.transcripts,
            &input.session_id,
            &all_lines,
            &state.config.compaction,
            original_request.as_deref(),
        )
        .await
        {
            Ok(summary) => {
                // The transcript now starts fresh from the marker block;
                // the tracked context-window usage resets with it.
                state.sessions.set_context_tokens(&input.session_key, 0);
                // Optionally ingest the summary to long-term memory.
                if state.config.memory_lifecycle.capture_on_compaction && !summary.is_empty() {
                    let memory = state.memory.clone();
                    let sk = input.session_key.clone();
                    let sid = input.session_id.clone();
                    // Build provenance metadata (includes agent fields for child agents).
                    let mut meta =
                        agent::provenance_metadata(input.agent.as_ref(), &sk, &sid)
                            .unwrap_or_default();
                    meta.insert("sa.compaction".into(), serde_json::json!(true));
                    meta.insert("sa.session_key".into(), serde_json::json!(&sk));

                    tokio::spawn(async move {
                        let req = sa_memory::MemoryIngestRequest {
                            content: format!("Session summary (compacted):\n{summary}"),
                            source: Some("session_summary".into()),
                            session_id: Some(sid),
                            metadata: Some(meta),
                            extract_entities: Some(true),
                        };
                        if let Err(e) = memory.ingest(req).await {
                            tracing::warn!(error = %e, "compaction memory ingest failed");
                        }
                    });
                }

                // Reload transcript (now includes the compaction marker).
                all_lines = load_raw_transcript(&state.transcripts, &input.session_id);
                boundary = compact::compaction_boundary(&all_lines);
            }
            Err(e) => {
                tracing::warn!(error = %e, "auto-compaction failed, continuing with full history");
            }
        }
    }

    // 4. Convert active transcript lines (after last compaction) to messages.
    let history = transcript_lines_to_messages(&all_lines[boundary..]);

    // 5. Build the tool definitions (filtered by agent tool policy).
    let tool_policy = input.agent.as_ref().map(|a| &a.tool_policy);
    let tool_defs = tools::build_tool_definitions(state, tool_policy);

    // 6. Build conversation messages.
    let mut messages = Vec::new();
    messages.push(Message::system(&system_prompt));
    messages.extend(history);
    messages.push(Message::user(&input.user_message));

    // 7. Persist user message to transcript.
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "user",
        &input.user_message,
        None,
        Some(state.sessions.search_index()),
    )
    .await;

    Ok(TurnContext {
        provider,
        messages,
        tool_defs,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control-tool dispatch — gate tools, plan tool, delegation tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of running a single tool call through [`execute_tool_call`].
struct ToolOutcome {
    content: String,
    is_error: bool,
    /// Set by gate tools (`askUser`, `requestApproval`) and by the Approval
    /// Bridge when a confirmation is pending — the turn loop stops dispatching
    /// further iterations once any outcome in the batch sets this.
    pause: bool,
    /// Set only by `escalateToChapo` (sub-agents only, §4.5.2). Carries the
    /// escalation reason — the turn exits immediately with this as the
    /// terminal content, which the Sub-Agent Runner (`agent::run_agent`)
    /// hoists verbatim into the delegator's result (§4.6).
    escalated: Option<String>,
}

impl ToolOutcome {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            pause: false,
            escalated: None,
        }
    }

    fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            pause: false,
            escalated: None,
        }
    }
}

/// Route a single tool call: gate tools and delegation/plan control tools are
/// handled by the Turn Engine directly; everything else goes through the
/// Approval Bridge, which itself calls [`tools::dispatch_tool`] once (and if)
/// confirmation is satisfied.
async fn execute_tool_call(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
) -> ToolOutcome {
    match tc.tool_name.as_str() {
        "askUser" => handle_ask_user(state, tc, input, turn_id).await,
        "requestApproval" => handle_request_approval(state, tc, input, turn_id).await,
        "escalateToChapo" => handle_escalate_to_chapo(state, tc, input, turn_id).await,
        "setChapoPlan" => handle_set_chapo_plan(state, tc, input, turn_id).await,
        "preflightAnswer" => handle_preflight_answer(state, tc, input, turn_id).await,
        "delegateToDevo" => handle_delegate(state, tc, input, turn_id, AgentKind::Devo).await,
        "delegateToCaio" => handle_delegate(state, tc, input, turn_id, AgentKind::Caio).await,
        "delegateToScout" => handle_delegate(state, tc, input, turn_id, AgentKind::Scout).await,
        "delegateParallel" => handle_delegate_parallel(state, tc, input, turn_id).await,
        _ => {
            let outcome = approval_bridge::run(
                state,
                &tc.tool_name,
                &tc.arguments,
                &input.session_key,
                &input.session_id,
                turn_id,
                Some(turn_id),
                input.agent.as_ref(),
            )
            .await;
            match outcome {
                Ok(approval_bridge::BridgeOutcome::Executed { content, is_error }) => {
                    let content = agent::encode_evidence(input.agent.as_ref(), &tc.tool_name, &content, is_error);
                    ToolOutcome {
                        content,
                        is_error,
                        pause: false,
                        escalated: None,
                    }
                }
                Ok(approval_bridge::BridgeOutcome::PendingConfirmation { action }) => ToolOutcome {
                    content: format!(
                        "action \"{}\" is awaiting approval (action_id={})",
                        action.description, action.id
                    ),
                    is_error: false,
                    pause: true,
                    escalated: None,
                },
                Ok(approval_bridge::BridgeOutcome::Denied { reason }) => ToolOutcome::err(reason),
                Err(e) => ToolOutcome::err(e.to_string()),
            }
        }
    }
}

async fn handle_ask_user(state: &AppState, tc: &ToolCall, input: &TurnInput, turn_id: &str) -> ToolOutcome {
    let question_text = tc
        .arguments
        .get("question")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if question_text.is_empty() {
        return ToolOutcome::err("askUser requires a non-empty \"question\" argument");
    }
    let from_agent = input
        .agent
        .as_ref()
        .map(|a| a.agent_id.clone())
        .unwrap_or_else(|| "chapo".to_string());

    let mut question = UserQuestion::new(question_text, from_agent);
    question.turn_id = Some(turn_id.to_string());
    question.question_kind = tc
        .arguments
        .get("question_kind")
        .and_then(|v| v.as_str())
        .map(String::from);
    question.fingerprint = tc
        .arguments
        .get("fingerprint")
        .and_then(|v| v.as_str())
        .map(String::from);

    if state.config.turn.gate_dedup_enabled {
        if let Some(fingerprint) = question.fingerprint.clone() {
            let _ = state.conversation_store.ensure_loaded(&input.session_id).await;
            let now = chrono::Utc::now();
            if let Some(existing) = state
                .conversation_store
                .get(&input.session_id)
                .and_then(|s| s.find_pending_question_dedup(turn_id, &fingerprint, now).cloned())
            {
                return ToolOutcome {
                    content: format!("question already pending: {}", existing.question_id),
                    is_error: false,
                    pause: true,
                    escalated: None,
                };
            }
        }
    }

    let question_id = question.question_id.clone();
    let payload = serde_json::to_value(&question).unwrap_or_default();
    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Ui,
            event_types::GATE_QUESTION_QUEUED,
            payload,
        ))
        .await;

    ToolOutcome {
        content: format!("awaiting user answer (question_id={question_id})"),
        is_error: false,
        pause: true,
        escalated: None,
    }
}

async fn handle_request_approval(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
) -> ToolOutcome {
    let description = tc
        .arguments
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if description.is_empty() {
        return ToolOutcome::err("requestApproval requires a non-empty \"description\" argument");
    }
    let risk_level = match tc.arguments.get("risk_level").and_then(|v| v.as_str()) {
        Some("high") => RiskLevel::High,
        Some("medium") | None => RiskLevel::Medium,
        Some("low") => RiskLevel::Low,
        Some(other) => return ToolOutcome::err(format!("unknown risk_level \"{other}\"")),
    };
    let actions = tc
        .arguments
        .get("actions")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect::<Vec<_>>())
        .unwrap_or_default();
    let from_agent = input
        .agent
        .as_ref()
        .map(|a| a.agent_id.clone())
        .unwrap_or_else(|| "chapo".to_string());

    let approval = ApprovalRequest::new(description, risk_level, actions, from_agent);
    let approval_id = approval.approval_id.clone();
    let payload = serde_json::to_value(&approval).unwrap_or_default();
    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Ui,
            event_types::GATE_APPROVAL_QUEUED,
            payload,
        ))
        .await;

    ToolOutcome {
        content: format!("awaiting user approval (approval_id={approval_id})"),
        is_error: false,
        pause: true,
        escalated: None,
    }
}

/// `escalateToChapo` — sub-agents only (§4.5.2). Exits the sub-agent's turn
/// immediately with the escalation reason as terminal content; the Sub-Agent
/// Runner surfaces this as its `escalated` exit reason (§4.6) and hoists the
/// reason into the parent delegator's result.
async fn handle_escalate_to_chapo(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
) -> ToolOutcome {
    if input.agent.is_none() {
        return ToolOutcome::err("escalateToChapo is only available to sub-agents");
    }
    let reason = tc.arguments.get("reason").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let _ = state.conversation_store.ensure_loaded(&input.session_id).await;
    if let Err(e) = state.conversation_store.update(&input.session_id, |s| {
        s.push_agent_history(AgentKind::Chapo);
        s.active_agent = AgentKind::Chapo;
    }) {
        return ToolOutcome::err(format!("failed to escalate: {e}"));
    }
    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Internal,
            event_types::AGENT_SWITCHED,
            serde_json::json!({ "to": AgentKind::Chapo.as_str(), "reason": reason }),
        ))
        .await;
    ToolOutcome {
        content: format!("escalated to chapo: {reason}"),
        is_error: false,
        pause: true,
        escalated: Some(reason),
    }
}

async fn handle_set_chapo_plan(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
) -> ToolOutcome {
    let title = tc.arguments.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let steps: Vec<PlanStep> = match tc.arguments.get("steps").and_then(|v| v.as_array()) {
        Some(arr) => {
            let mut steps = Vec::with_capacity(arr.len());
            for (idx, raw) in arr.iter().enumerate() {
                let id = raw
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| (idx + 1).to_string());
                let text = raw.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let owner = match raw.get("owner").and_then(|v| v.as_str()) {
                    Some("devo") => StepOwner::Devo,
                    Some("scout") => StepOwner::Scout,
                    Some("caio") => StepOwner::Caio,
                    _ => StepOwner::Chapo,
                };
                let status = match raw.get("status").and_then(|v| v.as_str()) {
                    Some("doing") => StepStatus::Doing,
                    Some("done") => StepStatus::Done,
                    Some("blocked") => StepStatus::Blocked,
                    _ => StepStatus::Todo,
                };
                steps.push(PlanStep { id, text, owner, status });
            }
            steps
        }
        None => Vec::new(),
    };

    let _ = state.conversation_store.ensure_loaded(&input.session_id).await;
    let previous = state.conversation_store.get(&input.session_id).and_then(|s| s.current_plan);

    let plan = match Plan::new_version(previous.as_ref(), title, steps) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::err(e.to_string()),
    };

    let plan_clone = plan.clone();
    if let Err(e) = state.conversation_store.update(&input.session_id, move |s| {
        if let Some(prev) = s.current_plan.take() {
            s.plan_history.push(prev);
        }
        s.current_plan = Some(plan_clone);
    }) {
        return ToolOutcome::err(format!("failed to store plan: {e}"));
    }
    state.conversation_store.schedule_flush(input.session_id.clone());

    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Ui,
            event_types::PLAN_READY,
            serde_json::to_value(&plan).unwrap_or_default(),
        ))
        .await;

    ToolOutcome::ok(format!("plan \"{}\" v{} saved", plan.title, plan.version))
}

/// §4.5.6 — checks a draft final answer against open blocking obligations
/// (or an explicit `must_address` list) before CHAPO sends it to the user.
async fn handle_preflight_answer(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
) -> ToolOutcome {
    let draft = tc.arguments.get("draft").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let must_address: Vec<String> = tc
        .arguments
        .get("must_address")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let strict = tc.arguments.get("strict").and_then(|v| v.as_bool()).unwrap_or(false);

    let _ = state.conversation_store.ensure_loaded(&input.session_id).await;
    let snapshot = state.conversation_store.get(&input.session_id);
    let (obligations, original_request) = match &snapshot {
        Some(s) => (s.obligations.clone(), s.task_context.original_request.clone()),
        None => (Vec::new(), None),
    };

    let result = preflight_answer(
        &draft,
        &must_address,
        &obligations,
        Some(turn_id),
        original_request.as_deref(),
        strict,
    );

    ToolOutcome::ok(
        serde_json::to_string(&result).unwrap_or_else(|_| "{\"ok\":false}".to_string()),
    )
}

async fn handle_delegate(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
    target: AgentKind,
) -> ToolOutcome {
    let task = tc.arguments.get("task").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
    if task.is_empty() {
        return ToolOutcome::err("delegation requires a non-empty \"task\" argument");
    }
    let model_override = tc.arguments.get("model").and_then(|v| v.as_str()).map(String::from);

    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Ui,
            event_types::AGENT_DELEGATED,
            serde_json::json!({ "to": target.as_str(), "task": task }),
        ))
        .await;
    let _ = state.conversation_store.ensure_loaded(&input.session_id).await;
    let _ = state.conversation_store.update(&input.session_id, |s| {
        s.push_agent_history(target);
    });
    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Internal,
            event_types::AGENT_STARTED,
            serde_json::json!({ "agent": target.as_str() }),
        ))
        .await;

    let (content, is_error, exit_reason) =
        agent::run_agent(state, target.as_str(), &task, model_override, &input.session_key).await;

    let completion_event = if is_error {
        event_types::AGENT_FAILED
    } else {
        event_types::AGENT_COMPLETED
    };
    state
        .event_bus
        .publish(WorkflowEventEnvelope::new(
            &input.session_id,
            turn_id,
            Some(turn_id.to_string()),
            "turn_engine",
            EventVisibility::Ui,
            completion_event,
            serde_json::json!({
                "agent": target.as_str(),
                "result": content,
                "exit_reason": exit_reason.as_str(),
            }),
        ))
        .await;
    let _ = state.conversation_store.update(&input.session_id, |s| {
        s.push_agent_history(AgentKind::Chapo);
    });

    ToolOutcome {
        content,
        is_error,
        pause: false,
        escalated: None,
    }
}

async fn handle_delegate_parallel(
    state: &AppState,
    tc: &ToolCall,
    input: &TurnInput,
    turn_id: &str,
) -> ToolOutcome {
    let tasks = match tc.arguments.get("tasks").and_then(|v| v.as_array()) {
        Some(arr) if !arr.is_empty() => arr.clone(),
        _ => return ToolOutcome::err("delegateParallel requires a non-empty \"tasks\" array"),
    };

    let mut futures = Vec::with_capacity(tasks.len());
    for raw in &tasks {
        let target = match raw.get("agent").and_then(|v| v.as_str()) {
            Some("devo") => AgentKind::Devo,
            Some("caio") => AgentKind::Caio,
            Some("scout") => AgentKind::Scout,
            Some("chapo") => AgentKind::Chapo,
            _ => return ToolOutcome::err("each delegateParallel task needs a valid \"agent\""),
        };
        let task_text = raw.get("task").and_then(|v| v.as_str()).unwrap_or("").to_string();
        futures.push(async move {
            state
                .event_bus
                .publish(WorkflowEventEnvelope::new(
                    &input.session_id,
                    turn_id,
                    Some(turn_id.to_string()),
                    "turn_engine",
                    EventVisibility::Ui,
                    event_types::AGENT_DELEGATED,
                    serde_json::json!({ "to": target.as_str(), "task": task_text }),
                ))
                .await;
            let (content, is_error, exit_reason) =
                agent::run_agent(state, target.as_str(), &task_text, None, &input.session_key).await;
            serde_json::json!({
                "agent": target.as_str(),
                "result": truncate_str(&content, 1200),
                "is_error": is_error,
                "exit_reason": exit_reason.as_str(),
            })
        });
    }

    let results = futures_util::future::join_all(futures).await;
    let any_error = results.iter().any(|r| r.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false));
    let content = serde_json::to_string(&results).unwrap_or_else(|_| "[]".into());

    ToolOutcome {
        content,
        is_error: any_error,
        pause: false,
        escalated: None,
    }
}
