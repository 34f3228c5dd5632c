//! Per-session diagnostic log.
//!
//! Requests that carry the test-info marker record every intermediate routing
//! step here, keyed by their session id. Entries are drained on poll, and a
//! session whose queue a poll leaves empty is forgotten.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use serde::Serialize;

/// One recorded routing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    /// When the step was recorded.
    pub timestamp: SystemTime,
    /// Human-readable description of the step.
    pub message: String,
}

/// Lock-free log of routing steps grouped by session id.
#[derive(Debug, Default)]
pub struct SessionLog {
    sessions: DashMap<String, Arc<SegQueue<SessionEntry>>>,
}

impl SessionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to `session`.
    pub fn record(&self, session: &str, message: impl Into<String>) {
        let entry = SessionEntry {
            timestamp: SystemTime::now(),
            message: message.into(),
        };
        // Pushed under the entry guard so a concurrent poll cannot remove the
        // queue between lookup and push.
        self.sessions
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .push(entry);
    }

    /// Drain every entry recorded for `session`, oldest first.
    pub fn poll(&self, session: &str) -> Vec<SessionEntry> {
        let Some(queue) = self.sessions.get(session).map(|q| Arc::clone(q.value())) else {
            return Vec::new();
        };
        let mut entries = Vec::with_capacity(queue.len());
        while let Some(entry) = queue.pop() {
            entries.push(entry);
        }
        self.sessions.remove_if(session, |_, queue| queue.is_empty());
        entries
    }

    /// Drain every session. Sessions with nothing new are omitted.
    pub fn poll_all(&self) -> HashMap<String, Vec<SessionEntry>> {
        self.session_ids()
            .into_iter()
            .filter_map(|id| {
                let entries = self.poll(&id);
                (!entries.is_empty()).then_some((id, entries))
            })
            .collect()
    }

    /// Ids of sessions holding entries that have not been polled yet.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Forget `session`.
    pub fn clear(&self, session: &str) {
        self.sessions.remove(session);
    }

    /// Forget every session.
    pub fn clear_all(&self) {
        self.sessions.clear();
    }
}
