//! Tunables for the orchestrator and the stores it owns.
//!
//! ## Defaults
//!
//! - [`DEFAULT_SESSION_CAPACITY`] - entries kept per session window
//! - [`DEFAULT_CHANNEL_CAPACITY`] - events buffered per call
//! - [`DEFAULT_STREAM_IDLE_TIMEOUT`] - subscriber inactivity window
//! - [`DEFAULT_MAX_INFLIGHT_CALLS`] - admission limit for non-terminal calls
//! - [`DEFAULT_SHUTDOWN_TIMEOUT`] - drain budget during graceful shutdown

use crate::error::{Error, Result};
use core::time::Duration;

pub const DEFAULT_SESSION_CAPACITY: usize = 50;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_INFLIGHT_CALLS: usize = 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of entries retained per session. Older entries slide
    /// out of the window.
    pub session_capacity: usize,
    /// Events buffered per call. A full buffer makes the call wait for its
    /// slowest attached reader. With no reader attached the oldest events are
    /// dropped instead.
    pub channel_capacity: usize,
    /// How long a subscriber waits for the next event before it treats the
    /// stream as abandoned.
    pub stream_idle_timeout: Duration,
    /// Number of non-terminal calls admitted at once.
    pub max_inflight_calls: usize,
    /// How long `shutdown` lets in-flight calls finish before cancelling
    /// them.
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_capacity: DEFAULT_SESSION_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            max_inflight_calls: DEFAULT_MAX_INFLIGHT_CALLS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl OrchestratorConfig {
    /// Rejects configurations that would make a store unusable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if any capacity or timeout is zero.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            (self.session_capacity == 0, "session_capacity"),
            (self.channel_capacity == 0, "channel_capacity"),
            (self.max_inflight_calls == 0, "max_inflight_calls"),
            (self.stream_idle_timeout.is_zero(), "stream_idle_timeout"),
        ];
        if let Some((_, field)) = zero.into_iter().find(|(is_zero, _)| *is_zero) {
            return Err(Error::InvalidRequest {
                reason: format!("{field} must be greater than 0"),
            });
        }
        Ok(())
    }
}
