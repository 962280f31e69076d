//! Bounded, per-session history of call lifecycle events.
//!
//! Sessions are created implicitly by their first append. Each keeps a
//! sliding window of the most recent `capacity` entries.

use crate::types::CallId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    ToolStarted,
    ToolFinished,
    ToolError,
    ToolCancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub call_id: CallId,
    #[serde(rename = "event")]
    pub kind: SessionEventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(call_id: CallId, kind: SessionEventKind, payload: Value) -> Self {
        Self {
            call_id,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub struct SessionLog {
    sessions: DashMap<String, VecDeque<SessionEntry>>,
    capacity: usize,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends `entry` to the tail of `session_id`, evicting from the head
    /// until the window fits.
    pub fn append(&self, session_id: &str, entry: SessionEntry) {
        let mut window = self
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        window.push_back(entry);
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    /// The current window, oldest first. Unknown sessions read as empty.
    pub fn read(&self, session_id: &str) -> Vec<SessionEntry> {
        self.sessions
            .get(session_id)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }
}
