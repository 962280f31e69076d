//! Error types for the call orchestration core.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure of the core. Failures raised inside a
//! running call never surface here; they are recorded on the call and
//! delivered to observers as a terminal `error` event instead.
//!
//! ## Error Cases
//! - `CallNotFound`: An unknown call identifier was used.
//! - `DuplicateSubmission`: Two submissions raced to register the same
//!   deduplication key. Absorbed by the orchestrator, never returned by
//!   `submit`.
//! - `AlreadyTerminal`: A transition targeted a call that already reached a
//!   terminal status.
//! - `InvalidTransition`: A transition that the state machine does not allow
//!   (for example `running -> pending`).
//! - `GeneratorFailure`: The external generator failed mid-stream.
//! - `InvalidRequest`: The submission was malformed.
//! - `ServiceOverloaded`: Too many calls are in flight.
//! - `ServiceShutdown`: A request arrived while the orchestrator was shutting
//!   down.
//! - `StreamTimeout`: A subscriber saw no event for its idle window.

use crate::{
    generator::GeneratorError,
    types::{CallId, CallStatus},
};
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the call orchestration core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The call identifier is unknown to the store.
    #[error("Call '{call_id}' not found")]
    CallNotFound { call_id: CallId },

    /// Another submission registered the key first.
    #[error("Deduplication key '{key}' already maps to call '{existing}'")]
    DuplicateSubmission { key: String, existing: CallId },

    /// The call is already finished, errored or cancelled.
    #[error("Call '{call_id}' is already {status}")]
    AlreadyTerminal { call_id: CallId, status: CallStatus },

    /// The state machine does not allow this transition.
    #[error("Call '{call_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        call_id: CallId,
        from: CallStatus,
        to: CallStatus,
    },

    /// The external generator failed.
    #[error("Generator failure: {0}")]
    GeneratorFailure(#[from] GeneratorError),

    /// The submission was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The admission limit was reached.
    #[error("Service is overloaded: {details}")]
    ServiceOverloaded { details: String },

    /// The orchestrator is shutting down and refuses new work.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// No event arrived for a subscriber within its idle window.
    #[error("Stream for call '{call_id}' idle for {idle:?}")]
    StreamTimeout { call_id: CallId, idle: Duration },
}

impl Error {
    /// A stable, machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CallNotFound { .. } => "CALL_NOT_FOUND",
            Self::DuplicateSubmission { .. } => "DUPLICATE_SUBMISSION",
            Self::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::GeneratorFailure(_) => "GENERATOR_FAILURE",
            Self::InvalidRequest { .. } => "VALIDATION_ERROR",
            Self::ServiceOverloaded { .. } => "SERVICE_OVERLOADED",
            Self::ServiceShutdown => "SERVICE_SHUTDOWN",
            Self::StreamTimeout { .. } => "STREAM_TIMEOUT",
        }
    }
}
