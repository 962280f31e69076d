//! Deduplication keys mapped to the calls they created.
//!
//! The index answers "has this key been seen?" quickly. The status stored
//! next to each key is a cache only; [`CallStore`](crate::CallStore) stays
//! authoritative.
//!
//! Registration goes through the map's entry API, so check-then-insert for
//! one key happens under that key's shard lock and two racing submissions
//! can never both win.

use crate::{
    error::{Error, Result},
    types::{CallId, CallStatus},
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub call_id: CallId,
    pub status: CallStatus,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyEntry {
    fn pending(call_id: CallId) -> Self {
        Self {
            call_id,
            status: CallStatus::Pending,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct IdempotencyIndex {
    entries: DashMap<String, IdempotencyEntry>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &str) -> Option<IdempotencyEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Binds `key` to `call_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSubmission`] carrying the existing call if
    /// the key is already bound.
    pub fn register(&self, key: &str, call_id: CallId) -> Result<()> {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(existing) => Err(Error::DuplicateSubmission {
                key: key.to_owned(),
                existing: existing.get().call_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyEntry::pending(call_id));
                Ok(())
            }
        }
    }

    /// Moves `key` from `expected` to `call_id`, but only if it still points
    /// at `expected`. Used to retry a key whose call ended in `error`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSubmission`] if another submission rebound
    /// the key first.
    pub fn rebind(&self, key: &str, expected: CallId, call_id: CallId) -> Result<()> {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut current) if current.get().call_id == expected => {
                current.insert(IdempotencyEntry::pending(call_id));
                Ok(())
            }
            Entry::Occupied(current) => Err(Error::DuplicateSubmission {
                key: key.to_owned(),
                existing: current.get().call_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyEntry::pending(call_id));
                Ok(())
            }
        }
    }

    /// Refreshes the cached status for `key` if it still points at
    /// `call_id`. Returns whether anything changed.
    pub fn update_status(&self, key: &str, call_id: CallId, status: CallStatus) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.call_id == call_id => {
                entry.status = status;
                entry.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}
