//! HTTP surface of the orchestrator.
//!
//! ## Structure
//!
//! - [`handler`] - Route handlers and the shared [`CallService`] state.
//! - [`error`] - Mapping of core errors onto HTTP responses.
//!
//! ## Routes
//!
//! | Method | Path                          | Response                         |
//! |--------|-------------------------------|----------------------------------|
//! | POST   | `/mcp/execute`                | `{call_id, status, deduplicated}`|
//! | GET    | `/mcp/stream/{call_id}`       | SSE, one event per call event    |
//! | POST   | `/mcp/cancel/{call_id}`       | `{cancelled, status}`            |
//! | POST   | `/mcp/cancel_all`             | `{status, count, call_ids}`      |
//! | GET    | `/mcp/calls/{call_id}`        | call record                      |
//! | GET    | `/mcp/sessions/{session_id}`  | session window, oldest first     |
//! | GET    | `/healthz`                    | liveness                         |
//! | GET    | `/readyz`                     | readiness, 503 while draining    |

pub mod error;
pub mod handler;


use axum::{
    Router,
    routing::{get, post},
};
use handler::CallService;
use tower_http::cors::{Any, CorsLayer};
#[cfg(feature = "tracing")]
use {
    tower_http::{
        LatencyUnit,
        trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
    },
    tracing::Level,
};

/// Builds the application router. With the `tracing` feature every request
/// is logged with its method, path, status and latency.
pub fn router(service: CallService) -> Router {
    let router = Router::new()
        .route("/mcp/execute", post(handler::execute))
        .route("/mcp/stream/{call_id}", get(handler::stream))
        .route("/mcp/cancel/{call_id}", post(handler::cancel))
        .route("/mcp/cancel_all", post(handler::cancel_all))
        .route("/mcp/calls/{call_id}", get(handler::get_call))
        .route("/mcp/sessions/{session_id}", get(handler::read_session))
        .route("/healthz", get(handler::healthz))
        .route("/readyz", get(handler::readyz))
        .with_state(service)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    #[cfg(feature = "tracing")]
    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(
                DefaultOnResponse::new()
                    .level(Level::INFO)
                    .latency_unit(LatencyUnit::Millis),
            ),
    );

    router
}
