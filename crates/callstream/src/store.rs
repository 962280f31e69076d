//! Authoritative call records.
//!
//! [`CallStore`] is the single source of truth for call existence and status.
//! Records live in a sharded [`DashMap`], so transitions on the same call
//! serialize on that entry's shard while transitions on other calls proceed
//! in parallel.

use crate::{
    error::{Error, Result},
    types::{Call, CallId, CallStatus},
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

/// A requested status change together with the fields it sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Running,
    Finished { result: String },
    Failed { error: String },
    Cancelled,
}

impl Transition {
    pub const fn target(&self) -> CallStatus {
        match self {
            Self::Running => CallStatus::Running,
            Self::Finished { .. } => CallStatus::Finished,
            Self::Failed { .. } => CallStatus::Error,
            Self::Cancelled => CallStatus::Cancelled,
        }
    }
}

#[derive(Default)]
pub struct CallStore {
    calls: DashMap<CallId, Call>,
}

impl CallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new `pending` call and returns its freshly issued id.
    pub fn create(
        &self,
        tool: String,
        input: Value,
        session_id: Option<String>,
        dedup_key: Option<String>,
    ) -> CallId {
        let call = Call::new(tool, input, session_id, dedup_key);
        let id = call.id;
        self.calls.insert(id, call);
        id
    }

    /// Applies `transition` atomically and returns the updated record.
    ///
    /// # Errors
    ///
    /// - [`Error::CallNotFound`] if the call does not exist.
    /// - [`Error::AlreadyTerminal`] if the call already reached a terminal
    ///   status. The record is left untouched.
    /// - [`Error::InvalidTransition`] for any other move the state machine
    ///   forbids.
    pub fn transition(&self, call_id: &CallId, transition: Transition) -> Result<Call> {
        self.transition_with(call_id, transition, |_| {})
    }

    /// Like [`transition`](Self::transition), but runs `applied` on the
    /// updated record before the entry is unlocked.
    ///
    /// Whatever `applied` does is therefore ordered with every other
    /// transition of the same call. `applied` must not call back into the
    /// store.
    pub fn transition_with(
        &self,
        call_id: &CallId,
        transition: Transition,
        applied: impl FnOnce(&Call),
    ) -> Result<Call> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or(Error::CallNotFound { call_id: *call_id })?;

        let from = call.status;
        let to = transition.target();
        if from.is_terminal() {
            return Err(Error::AlreadyTerminal {
                call_id: *call_id,
                status: from,
            });
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                call_id: *call_id,
                from,
                to,
            });
        }

        let now = Utc::now();
        call.status = to;
        match transition {
            Transition::Running => call.started_at = Some(now),
            Transition::Finished { result } => {
                call.result = Some(result);
                call.completed_at = Some(now);
            }
            Transition::Failed { error } => {
                call.error = Some(error);
                call.completed_at = Some(now);
            }
            Transition::Cancelled => call.completed_at = Some(now),
        }

        applied(call.value());
        Ok(call.value().clone())
    }

    /// Returns a snapshot of the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotFound`] if the call does not exist.
    pub fn get(&self, call_id: &CallId) -> Result<Call> {
        self.calls
            .get(call_id)
            .map(|call| call.value().clone())
            .ok_or(Error::CallNotFound { call_id: *call_id })
    }

    pub fn status(&self, call_id: &CallId) -> Option<CallStatus> {
        self.calls.get(call_id).map(|call| call.status)
    }

    /// Removes a record that was never handed out, e.g. after losing a
    /// deduplication race.
    pub(crate) fn discard(&self, call_id: &CallId) -> bool {
        self.calls.remove(call_id).is_some()
    }
}
