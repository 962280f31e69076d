//! # Call Data Model
//!
//! Shared types describing a call, its lifecycle and the events it produces.
//!
//! ## Overview
//!
//! - [`CallId`] - Opaque, globally unique call identifier (UUID v4)
//! - [`CallStatus`] - The call state machine: `pending -> running ->
//!   {finished | error | cancelled}`
//! - [`Call`] - The record owned by the call store
//! - [`Event`] - Content and lifecycle events streamed to observers
//! - [`Submission`] - What `submit` hands back to the caller

use chrono::{DateTime, Utc};
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque identifier of a call. Issued once, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    /// Issues a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a call.
///
/// `Pending` and `Running` are the only non-terminal states. Transitions are
/// monotonic; nothing leaves a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Running,
    Finished,
    Error,
    Cancelled,
}

impl CallStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => !matches!(next, Self::Pending),
            Self::Running => next.is_terminal(),
            Self::Finished | Self::Error | Self::Cancelled => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of a tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub status: CallStatus,
    pub tool: String,
    pub input: Value,
    pub session_id: Option<String>,
    pub dedup_key: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn new(
        tool: String,
        input: Value,
        session_id: Option<String>,
        dedup_key: Option<String>,
    ) -> Self {
        Self {
            id: CallId::new(),
            status: CallStatus::Pending,
            tool,
            input,
            session_id,
            dedup_key,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// An event produced by a call, in production order.
///
/// Serialized with an internal `type` tag, e.g.
/// `{"type":"partial","text":"Hel"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// An incremental chunk of generated text.
    Partial { text: String },
    /// The full accumulated text. Terminal.
    Final { text: String },
    /// The call failed. Terminal.
    Error { message: String },
    /// The call was cancelled. Terminal.
    Cancelled { message: String },
}

impl Event {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Partial { .. })
    }

    /// The wire name of this event (`partial`, `final`, `error`,
    /// `cancelled`).
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Partial { .. } => "partial",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Outcome of `submit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub call_id: CallId,
    pub status: CallStatus,
    /// `true` when the deduplication key collapsed this submission onto an
    /// existing call.
    pub deduplicated: bool,
}
