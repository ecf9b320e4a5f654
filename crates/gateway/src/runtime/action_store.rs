//! Action Store (A), §4.4 — confirmation-gated tool calls created by the
//! Approval Bridge. Persisted independently of `ConversationState` (the
//! state store keyed by `sessionId`; actions are keyed by their own id but
//! scoped to a session for lookup/broadcast), with audit-logged
//! state transitions: `pending -> {approved -> executing -> {done|failed}
//! | rejected}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use sa_domain::error::{Error, Result};
use sa_domain::orchestration::{sanitize_args, Action, ActionStatus};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast payload for `action_pending` / `action_updated` (§6.2).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionBroadcast {
    pub session_key: String,
    pub action: Action,
    pub kind: ActionBroadcastKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionBroadcastKind {
    Pending,
    Updated,
}

struct SessionActions {
    by_id: HashMap<String, Action>,
}

/// Backed by a flat JSON file per session under `state_path/actions/`.
/// `create_action`/transition failures to persist are logged and treated
/// as non-fatal (§4.4: "failures are non-fatal, memory-only mode logged")
/// — the in-memory record remains authoritative for the running process.
pub struct ActionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, SessionActions>>,
    broadcast: broadcast::Sender<ActionBroadcast>,
}

impl ActionStore {
    pub fn new(state_path: &Path) -> Result<Arc<Self>> {
        let dir = state_path.join("actions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            dir,
            sessions: RwLock::new(HashMap::new()),
            broadcast: tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionBroadcast> {
        self.broadcast.subscribe()
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        self.dir.join(format!("{session_key}.json"))
    }

    fn load_session(&self, session_key: &str) -> SessionActions {
        let path = self.path_for(session_key);
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(by_id) = serde_json::from_str::<HashMap<String, Action>>(&raw) {
                return SessionActions { by_id };
            }
        }
        SessionActions {
            by_id: HashMap::new(),
        }
    }

    fn persist_session(&self, session_key: &str, actions: &SessionActions) {
        let path = self.path_for(session_key);
        match serde_json::to_string_pretty(&actions.by_id) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(session_key, error = %e, "action store persist failed (memory-only mode)");
                }
            }
            Err(e) => tracing::warn!(session_key, error = %e, "action store serialize failed"),
        }
    }

    fn with_session<F, R>(&self, session_key: &str, f: F) -> R
    where
        F: FnOnce(&mut SessionActions) -> R,
    {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| self.load_session(session_key));
        let result = f(entry);
        self.persist_session(session_key, entry);
        result
    }

    /// Create a new pending action, persist it, and broadcast `action_pending`.
    pub fn create_action(&self, session_key: &str, action: Action) -> Action {
        tracing::info!(
            session_key,
            action_id = %action.id,
            tool = %action.tool_name,
            args = %sanitize_args(&action.tool_args),
            "action created, awaiting approval"
        );
        self.with_session(session_key, |s| {
            s.by_id.insert(action.id.clone(), action.clone());
        });
        let _ = self.broadcast.send(ActionBroadcast {
            session_key: session_key.to_owned(),
            action: action.clone(),
            kind: ActionBroadcastKind::Pending,
        });
        action
    }

    pub fn get(&self, session_key: &str, action_id: &str) -> Option<Action> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| self.load_session(session_key));
        entry.by_id.get(action_id).cloned()
    }

    /// `pending -> rejected`. Illegal from any other state (§4.4).
    pub fn reject_action(&self, session_key: &str, action_id: &str) -> Result<Action> {
        let result = self.with_session(session_key, |s| {
            let action = s
                .by_id
                .get_mut(action_id)
                .ok_or_else(|| Error::ActionNotFound(action_id.to_string()))?;
            action.reject()?;
            Ok::<Action, Error>(action.clone())
        })?;
        tracing::info!(session_key, action_id, "action rejected");
        let _ = self.broadcast.send(ActionBroadcast {
            session_key: session_key.to_owned(),
            action: result.clone(),
            kind: ActionBroadcastKind::Updated,
        });
        Ok(result)
    }

    /// Approve a pending action and record the timestamp; does not execute
    /// it — the caller drives `start_executing`/`finish_*` around the
    /// actual tool invocation so the `executing` window reflects real work.
    pub fn approve(&self, session_key: &str, action_id: &str) -> Result<Action> {
        let result = self.with_session(session_key, |s| {
            let action = s
                .by_id
                .get_mut(action_id)
                .ok_or_else(|| Error::ActionNotFound(action_id.to_string()))?;
            action.approve()?;
            Ok::<Action, Error>(action.clone())
        })?;
        let _ = self.broadcast.send(ActionBroadcast {
            session_key: session_key.to_owned(),
            action: result.clone(),
            kind: ActionBroadcastKind::Updated,
        });
        Ok(result)
    }

    pub fn start_executing(&self, session_key: &str, action_id: &str) -> Result<Action> {
        let result = self.with_session(session_key, |s| {
            let action = s
                .by_id
                .get_mut(action_id)
                .ok_or_else(|| Error::ActionNotFound(action_id.to_string()))?;
            action.start_executing()?;
            Ok::<Action, Error>(action.clone())
        })?;
        let _ = self.broadcast.send(ActionBroadcast {
            session_key: session_key.to_owned(),
            action: result.clone(),
            kind: ActionBroadcastKind::Updated,
        });
        Ok(result)
    }

    pub fn finish(
        &self,
        session_key: &str,
        action_id: &str,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<Action> {
        let result = self.with_session(session_key, |s| {
            let action = s
                .by_id
                .get_mut(action_id)
                .ok_or_else(|| Error::ActionNotFound(action_id.to_string()))?;
            match outcome {
                Ok(value) => action.finish_success(value)?,
                Err(err) => action.finish_failure(err)?,
            }
            Ok::<Action, Error>(action.clone())
        })?;
        tracing::info!(
            session_key,
            action_id,
            status = ?result.status,
            "action finished"
        );
        let _ = self.broadcast.send(ActionBroadcast {
            session_key: session_key.to_owned(),
            action: result.clone(),
            kind: ActionBroadcastKind::Updated,
        });
        Ok(result)
    }

    /// List all non-terminal actions for a session (for `pendingActions` in
    /// terminal `response` events, §6.2).
    pub fn pending_for_session(&self, session_key: &str) -> Vec<Action> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| self.load_session(session_key));
        entry
            .by_id
            .values()
            .filter(|a| !a.is_terminal())
            .cloned()
            .collect()
    }

    pub fn status_of(&self, session_key: &str, action_id: &str) -> Option<ActionStatus> {
        self.get(session_key, action_id).map(|a| a.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Arc<ActionStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ActionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_approve_then_execute_then_finish() {
        let (_dir, store) = temp_store();
        let action = Action::new("fs_writeFile", serde_json::json!({"path":"notes.txt"}), "write notes.txt");
        let id = action.id.clone();
        store.create_action("s1", action);

        assert_eq!(store.status_of("s1", &id), Some(ActionStatus::Pending));
        store.approve("s1", &id).unwrap();
        assert_eq!(store.status_of("s1", &id), Some(ActionStatus::Approved));
        store.start_executing("s1", &id).unwrap();
        assert_eq!(store.status_of("s1", &id), Some(ActionStatus::Executing));
        store.finish("s1", &id, Ok(serde_json::json!({"ok": true}))).unwrap();
        assert_eq!(store.status_of("s1", &id), Some(ActionStatus::Done));
    }

    #[test]
    fn reject_from_pending_only() {
        let (_dir, store) = temp_store();
        let action = Action::new("exec", serde_json::json!({}), "run command");
        let id = action.id.clone();
        store.create_action("s1", action);
        store.reject_action("s1", &id).unwrap();
        assert_eq!(store.status_of("s1", &id), Some(ActionStatus::Rejected));
        assert!(store.approve("s1", &id).is_err());
    }

    #[test]
    fn unknown_action_errors() {
        let (_dir, store) = temp_store();
        let err = store.approve("s1", "ghost").unwrap_err();
        assert!(err.to_string().contains("action not found"));
    }

    #[test]
    fn pending_for_session_excludes_terminal() {
        let (_dir, store) = temp_store();
        let a1 = Action::new("exec", serde_json::json!({}), "cmd 1");
        let a2 = Action::new("exec", serde_json::json!({}), "cmd 2");
        let id2 = a2.id.clone();
        store.create_action("s1", a1);
        store.create_action("s1", a2);
        store.reject_action("s1", &id2).unwrap();

        let pending = store.pending_for_session("s1");
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn persists_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let action = Action::new("git", serde_json::json!({}), "push branch");
        let id = action.id.clone();
        {
            let store = ActionStore::new(dir.path()).unwrap();
            store.create_action("s1", action);
        }
        let store2 = ActionStore::new(dir.path()).unwrap();
        assert_eq!(store2.status_of("s1", &id), Some(ActionStatus::Pending));
    }
}
