//! Route handlers.
//!
//! Handlers are thin: they shape the request, call the [`Orchestrator`] and
//! serialize the result. Calls run on the orchestrator's own tasks, so a
//! client disconnecting from `/mcp/stream` never affects the call.

use super::error::ApiError;
use crate::server::config::ServerConfig;
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use callstream::{
    Call, CallId, CallStatus, EchoGenerator, Error, Event, Generator, Orchestrator,
    SessionEntry, Submission, SubmitRequest,
};
use core::convert::Infallible;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct CallService {
    orchestrator: Orchestrator,
    default_tool: Arc<str>,
}

impl CallService {
    /// Builds the orchestrator serving the built-in `echo` tool.
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let generator: Arc<dyn Generator> = Arc::new(EchoGenerator::new(config.echo_delay));
        let orchestrator = Orchestrator::new(config.orchestrator.clone(), generator)?;
        Ok(Self::with_orchestrator(orchestrator, &config.default_tool))
    }

    pub fn with_orchestrator(orchestrator: Orchestrator, default_tool: &str) -> Self {
        Self {
            orchestrator,
            default_tool: Arc::from(default_tool),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Refuses new calls, drains in-flight ones and cancels the rest.
    pub async fn shutdown(&self) {
        let _cancelled = self.orchestrator.shutdown().await;
        #[cfg(feature = "tracing")]
        tracing::info!(cancelled = _cancelled.len(), "Call service stopped");
    }
}

/// Body of `POST /mcp/execute`.
///
/// Accepts either an `input` object or a bare `messages` list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Idempotency token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ExecuteRequest {
    pub fn into_submit(self, default_tool: &str) -> SubmitRequest {
        let mut input = match self.input {
            Some(input) => input,
            None => {
                let mut input = Map::new();
                input.insert(
                    "messages".to_owned(),
                    Value::Array(self.messages.unwrap_or_default()),
                );
                input
            }
        };
        // The model is chosen server-side.
        input.remove("model");

        let tool = self
            .tool
            .filter(|tool| !tool.trim().is_empty())
            .unwrap_or_else(|| default_tool.to_owned());

        SubmitRequest {
            tool,
            input: Value::Object(input),
            session_id: self.session_id,
            dedup_key: self.request_id,
        }
    }
}

pub async fn execute(
    State(service): State<CallService>,
    request: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<Submission>, ApiError> {
    let Json(request) = request?;
    #[cfg(feature = "tracing")]
    tracing::info!(
        tool = ?request.tool,
        session_id = ?request.session_id,
        request_id = ?request.request_id,
        "Execute requested"
    );

    let submission = service
        .orchestrator
        .submit(request.into_submit(&service.default_tool))?;
    Ok(Json(submission))
}

pub async fn stream(
    State(service): State<CallService>,
    Path(call_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let call_id = parse_call_id(&call_id)?;
    let events = service
        .orchestrator
        .subscribe_and_drain(&call_id)?
        .map(|event| {
            let event = match event {
                Ok(event) => event,
                // Idle consumers are told why the stream ended.
                Err(Error::StreamTimeout { .. }) => Event::Error {
                    message: "timeout".to_owned(),
                },
                Err(err) => Event::Error {
                    message: err.to_string(),
                },
            };
            Ok(to_sse(&event))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &Event) -> SseEvent {
    match serde_json::to_string(event) {
        Ok(data) => SseEvent::default().event(event.kind()).data(data),
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to encode event: {_e}");
            SseEvent::default()
                .event("error")
                .data(r#"{"type":"error","message":"encoding failed"}"#)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub status: CallStatus,
}

pub async fn cancel(
    State(service): State<CallService>,
    Path(call_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let call_id = parse_call_id(&call_id)?;
    let cancelled = service.orchestrator().cancel(&call_id)?;
    let status = service.orchestrator().get_call(&call_id)?.status;
    Ok(Json(CancelResponse { cancelled, status }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelAllResponse {
    pub status: CallStatus,
    pub count: usize,
    pub call_ids: Vec<CallId>,
}

pub async fn cancel_all(State(service): State<CallService>) -> Json<CancelAllResponse> {
    let call_ids = service.orchestrator().cancel_all();
    Json(CancelAllResponse {
        status: CallStatus::Cancelled,
        count: call_ids.len(),
        call_ids,
    })
}

pub async fn get_call(
    State(service): State<CallService>,
    Path(call_id): Path<String>,
) -> Result<Json<Call>, ApiError> {
    let call_id = parse_call_id(&call_id)?;
    Ok(Json(service.orchestrator().get_call(&call_id)?))
}

pub async fn read_session(
    State(service): State<CallService>,
    Path(session_id): Path<String>,
) -> Json<Vec<SessionEntry>> {
    Json(service.orchestrator().read_session(&session_id))
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(service): State<CallService>) -> Response {
    if service.orchestrator().is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reasons": ["shutting down"] })),
        )
            .into_response();
    }
    Json(json!({ "ready": true, "inflight": service.orchestrator().inflight() })).into_response()
}

fn parse_call_id(raw: &str) -> Result<CallId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::MalformedCallId(raw.to_owned()))
}
