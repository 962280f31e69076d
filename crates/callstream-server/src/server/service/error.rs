//! HTTP error responses.
//!
//! Every failure is rendered as
//! `{"error": {"message": ..., "error_code": ..., "type": ...}}` with a
//! status code chosen per error kind.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use callstream::Error;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),

    /// The path segment is not a call id at all.
    #[error("Call '{0}' not found")]
    MalformedCallId(String),

    /// The request body is not JSON or does not match the expected shape.
    #[error("Invalid request body: {}", .0.body_text())]
    Body(#[from] JsonRejection),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Body(rejection) => rejection.status(),
            Self::MalformedCallId(_) | Self::Core(Error::CallNotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            Self::Core(Error::InvalidRequest { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Core(Error::ServiceOverloaded { .. } | Error::ServiceShutdown) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Core(Error::GeneratorFailure(_)) => StatusCode::BAD_GATEWAY,
            Self::Core(
                Error::AlreadyTerminal { .. }
                | Error::InvalidTransition { .. }
                | Error::DuplicateSubmission { .. },
            ) => StatusCode::CONFLICT,
            Self::Core(Error::StreamTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Core(err) => err.code(),
            Self::MalformedCallId(_) => "CALL_NOT_FOUND",
            Self::Body(_) => "VALIDATION_ERROR",
        }
    }

    /// Name of the error kind, reported as `type`.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedCallId(_) | Self::Core(Error::CallNotFound { .. }) => "CallNotFound",
            Self::Core(Error::DuplicateSubmission { .. }) => "DuplicateSubmission",
            Self::Core(Error::AlreadyTerminal { .. }) => "AlreadyTerminal",
            Self::Core(Error::InvalidTransition { .. }) => "InvalidTransition",
            Self::Core(Error::GeneratorFailure(_)) => "GeneratorFailure",
            Self::Body(_) | Self::Core(Error::InvalidRequest { .. }) => "InvalidRequest",
            Self::Core(Error::ServiceOverloaded { .. }) => "ServiceOverloaded",
            Self::Core(Error::ServiceShutdown) => "ServiceShutdown",
            Self::Core(Error::StreamTimeout { .. }) => "StreamTimeout",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            #[cfg(feature = "tracing")]
            tracing::warn!(code = self.code(), "Request failed: {self}");
        }

        let body = json!({
            "error": {
                "message": self.to_string(),
                "error_code": self.code(),
                "type": self.kind(),
            }
        });
        (status, Json(body)).into_response()
    }
}
