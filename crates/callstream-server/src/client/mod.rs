//! Async client for a running `callstream-server`.
//!
//! [`CallClient`] wraps the HTTP routes: submit a call, follow its events
//! over Server-Sent Events, cancel calls, and inspect calls and sessions.
//! Server errors come back as [`ClientError::Api`] with the server's
//! `error_code` and `type`.
//!
//! ```no_run
//! # async fn run() -> callstream_server::client::Result<()> {
//! use callstream_server::{client::CallClient, server::service::handler::ExecuteRequest};
//! use serde_json::{Map, json};
//!
//! let client = CallClient::new("http://127.0.0.1:8080")?;
//! let mut input = Map::new();
//! input.insert("text".into(), json!("hello there"));
//! let text = client
//!     .call_tool(&ExecuteRequest {
//!         input: Some(input),
//!         ..ExecuteRequest::default()
//!     })
//!     .await?;
//! assert_eq!(text, "hello there");
//! # Ok(())
//! # }
//! ```

mod sse;


use crate::server::service::handler::{CancelAllResponse, CancelResponse, ExecuteRequest};
use callstream::{Call, CallId, Event, SessionEntry, Submission};
use futures::{StreamExt, stream::BoxStream};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use sse::SseDecoder;
use std::collections::VecDeque;

pub type Result<T> = core::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Invalid server URL '{0}'")]
    InvalidUrl(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The server rejected the request.
    #[error("{kind} ({code}, HTTP {status}): {message}")]
    Api {
        status: StatusCode,
        code: String,
        kind: String,
        message: String,
    },

    #[error("Malformed event: {0}")]
    Decode(#[from] serde_json::Error),

    /// The call ended with an `error` event.
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// The call ended with a `cancelled` event.
    #[error("Call cancelled: {0}")]
    CallCancelled(String),

    /// The event stream closed before the call reached a terminal state.
    #[error("Event stream ended before the call did")]
    Incomplete,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    error_code: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Clone, Debug)]
pub struct CallClient {
    http: reqwest::Client,
    base: Url,
}

impl CallClient {
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] unless `base_url` is an absolute
    /// URL that paths can be appended to.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Uses a preconfigured `reqwest` client, e.g. one with timeouts.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self> {
        match Url::parse(base_url) {
            Ok(base) if !base.cannot_be_a_base() => Ok(Self { http, base }),
            _ => Err(ClientError::InvalidUrl(base_url.to_owned())),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in the constructor.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Starts a call. Returns as soon as the server accepted it.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<Submission> {
        let response = self
            .http
            .post(self.endpoint(&["mcp", "execute"]))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    /// Follows a call's events, replaying what was already produced. The
    /// stream ends after the terminal event.
    pub async fn stream_results(
        &self,
        call_id: &CallId,
    ) -> Result<BoxStream<'static, Result<Event>>> {
        let response = self
            .http
            .get(self.endpoint(&["mcp", "stream", &call_id.to_string()]))
            .send()
            .await?;
        Ok(events(check(response).await?))
    }

    /// Starts a call and waits for its final text.
    ///
    /// # Errors
    ///
    /// Besides transport and API errors, returns [`ClientError::CallFailed`]
    /// or [`ClientError::CallCancelled`] if the call did not finish.
    pub async fn call_tool(&self, request: &ExecuteRequest) -> Result<String> {
        let submission = self.execute(request).await?;
        let mut events = self.stream_results(&submission.call_id).await?;
        while let Some(event) = events.next().await {
            match event? {
                Event::Partial { .. } => {}
                Event::Final { text } => return Ok(text),
                Event::Error { message } => return Err(ClientError::CallFailed(message)),
                Event::Cancelled { message } => return Err(ClientError::CallCancelled(message)),
            }
        }
        Err(ClientError::Incomplete)
    }

    pub async fn cancel(&self, call_id: &CallId) -> Result<CancelResponse> {
        let response = self
            .http
            .post(self.endpoint(&["mcp", "cancel", &call_id.to_string()]))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn cancel_all(&self) -> Result<CancelAllResponse> {
        let response = self
            .http
            .post(self.endpoint(&["mcp", "cancel_all"]))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn get_call(&self, call_id: &CallId) -> Result<Call> {
        let response = self
            .http
            .get(self.endpoint(&["mcp", "calls", &call_id.to_string()]))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn read_session(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        let response = self
            .http
            .get(self.endpoint(&["mcp", "sessions", session_id]))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn health(&self) -> Result<Value> {
        let response = self.http.get(self.endpoint(&["healthz"])).send().await?;
        decode(response).await
    }

    /// Whether the server accepts new calls. A draining server answers
    /// `false` rather than an error.
    pub async fn ready(&self) -> Result<bool> {
        let response = self.http.get(self.endpoint(&["readyz"])).send().await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(false);
        }
        let body: Value = decode(response).await?;
        Ok(body["ready"].as_bool().unwrap_or(false))
    }
}

/// Passes successful responses through and turns the rest into
/// [`ClientError::Api`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await?;
    Err(match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(ErrorEnvelope { error }) => ClientError::Api {
            status,
            code: error.error_code,
            kind: error.kind,
            message: error.message,
        },
        Err(_) => ClientError::Api {
            status,
            code: status.as_str().to_owned(),
            kind: status.canonical_reason().unwrap_or("Unknown").to_owned(),
            message: text,
        },
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    Ok(check(response).await?.json().await?)
}

/// Decodes an SSE body into call events, stopping after the terminal one.
fn events(response: Response) -> BoxStream<'static, Result<Event>> {
    let body = response.bytes_stream().boxed();
    let state = (body, SseDecoder::default(), VecDeque::<String>::new(), false);

    futures::stream::unfold(state, |(mut body, mut decoder, mut ready, mut done)| async move {
        loop {
            if let Some(data) = ready.pop_front() {
                let event = serde_json::from_str::<Event>(&data).map_err(ClientError::from);
                if event.as_ref().is_ok_and(Event::is_terminal) {
                    ready.clear();
                    done = true;
                }
                return Some((event, (body, decoder, ready, done)));
            }
            if done {
                return None;
            }

            match body.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                Some(Err(err)) => {
                    return Some((Err(err.into()), (body, decoder, ready, true)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
