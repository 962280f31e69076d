//! Cancellation handles for in-flight calls.
//!
//! Each non-terminal call owns one [`CancellationToken`]. Signalling a token
//! is cooperative: the running unit observes it at its next chunk boundary.
//! A token is signalled at most once; later requests report `false`.

use crate::types::CallId;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancellationRegistry {
    handles: DashMap<CallId, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_id: CallId, token: CancellationToken) {
        self.handles.insert(call_id, token);
    }

    /// Signals the handle of `call_id`. Returns whether this request
    /// delivered the signal (`false` if unknown or already signalled).
    pub fn cancel(&self, call_id: &CallId) -> bool {
        // `get_mut` takes the shard write lock, so two concurrent cancels
        // cannot both observe an unsignalled token.
        self.handles
            .get_mut(call_id)
            .is_some_and(|token| signal(&token))
    }

    /// Signals every registered handle that has not been signalled yet and
    /// returns their calls.
    pub fn cancel_all(&self) -> Vec<CallId> {
        self.handles
            .iter_mut()
            .filter(|entry| signal(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drops the handle of a call that reached a terminal state.
    pub fn unregister(&self, call_id: &CallId) -> bool {
        self.handles.remove(call_id).is_some()
    }
}

fn signal(token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    token.cancel();
    true
}
