//! Inbox (I): per-session FIFO for commands that arrive while a turn is
//! already running. The dispatcher drains a session's inbox once its
//! current turn finishes, so a user message sent mid-turn is never dropped
//! and never races the in-flight turn for the same session's state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A queued command awaiting the session to become free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub session_key: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct Queues {
    by_session: HashMap<String, Vec<InboxMessage>>,
}

/// Session inbox: push while busy, drain once free.
pub struct Inbox {
    queues: Mutex<Queues>,
}

impl Inbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(Queues::default()),
        })
    }

    /// Enqueue a command for `session_key`. FIFO within a session.
    pub fn push(&self, message: InboxMessage) {
        let mut queues = self.queues.lock();
        queues
            .by_session
            .entry(message.session_key.clone())
            .or_default()
            .push(message);
    }

    /// Remove and return all queued commands for `session_key`, in order.
    /// Leaves the session absent from the map if nothing was queued.
    pub fn drain(&self, session_key: &str) -> Vec<InboxMessage> {
        self.queues
            .lock()
            .by_session
            .remove(session_key)
            .unwrap_or_default()
    }

    /// Whether any commands are queued for `session_key`.
    pub fn has_pending(&self, session_key: &str) -> bool {
        self.queues
            .lock()
            .by_session
            .get(session_key)
            .is_some_and(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(session_key: &str, id: &str) -> InboxMessage {
        InboxMessage {
            id: id.into(),
            session_key: session_key.into(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn push_then_drain_is_fifo() {
        let inbox = Inbox::new();
        inbox.push(msg("s1", "a"));
        inbox.push(msg("s1", "b"));
        inbox.push(msg("s2", "c"));

        let drained = inbox.drain("s1");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, "a");
        assert_eq!(drained[1].id, "b");

        // s2 untouched, s1 now empty.
        assert!(inbox.has_pending("s2"));
        assert!(!inbox.has_pending("s1"));
    }

    #[test]
    fn drain_on_empty_session_returns_empty() {
        let inbox = Inbox::new();
        assert!(inbox.drain("ghost").is_empty());
    }
}
