//! State Projection (§4.7): the only projection allowed to mutate
//! `ConversationState`. Applies the narrow set of event types that carry a
//! state change — everything else (progress narration, heartbeats) passes
//! through untouched.

use std::sync::Arc;

use sa_domain::orchestration::{event_types, ApprovalRequest, ConversationState, Phase, UserQuestion};
use sa_sessions::ConversationStateStore;

use crate::events::bus::Projection;
use crate::events::envelope::WorkflowEventEnvelope;

pub struct StateProjection {
    store: Arc<ConversationStateStore>,
}

impl StateProjection {
    pub fn new(store: Arc<ConversationStateStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Projection for StateProjection {
    fn name(&self) -> &'static str {
        "state"
    }

    async fn handle(&self, event: &WorkflowEventEnvelope) -> anyhow::Result<()> {
        self.store.ensure_loaded(&event.session_id).await?;

        match event.event_type.as_str() {
            event_types::GATE_QUESTION_QUEUED => {
                let question: UserQuestion = serde_json::from_value(event.payload.clone())?;
                self.store.update(&event.session_id, |state: &mut ConversationState| {
                    state.pending_questions.push(question);
                    state.phase = Phase::WaitingUser;
                })?;
                self.store.flush_now(&event.session_id).await?;
            }
            event_types::GATE_APPROVAL_QUEUED => {
                let approval: ApprovalRequest = serde_json::from_value(event.payload.clone())?;
                self.store.update(&event.session_id, |state: &mut ConversationState| {
                    state.pending_approvals.push(approval);
                    state.phase = Phase::WaitingUser;
                })?;
                self.store.flush_now(&event.session_id).await?;
            }
            event_types::TOOL_ACTION_PENDING => {
                self.store.update(&event.session_id, |state: &mut ConversationState| {
                    state.phase = Phase::WaitingUser;
                })?;
                self.store.flush_now(&event.session_id).await?;
            }
            event_types::GATE_QUESTION_RESOLVED | event_types::GATE_APPROVAL_RESOLVED => {
                // Resolution events are handled directly by the Command
                // Dispatcher (`dispatcher::handle_question_answered` /
                // `handle_approval_decided`), which owns the
                // queue/dequeue of `pending_questions`/`pending_approvals`
                // as part of its resume-turn transition. This projection
                // only observes the event for audit; it does not mutate
                // state on resolution, to avoid a race between the
                // projection and the dispatcher both removing the entry.
            }
            event_types::AGENT_STARTED | event_types::AGENT_SWITCHED => {
                // Agent kind transitions are applied by the Turn Engine directly
                // via `ConversationState::push_agent_history`, which already owns
                // the history-trimming invariant; the projection only schedules
                // the debounced flush here.
                self.store.schedule_flush(event.session_id.clone());
            }
            event_types::WF_COMPLETED | event_types::WF_FAILED => {
                self.store.update(&event.session_id, |state: &mut ConversationState| {
                    state.active_turn_id = None;
                    state.is_loop_running = false;
                })?;
                self.store.flush_now(&event.session_id).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
