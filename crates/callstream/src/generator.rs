//! The seam to the external streaming generator.
//!
//! A [`Generator`] turns a [`GenerationRequest`] into a lazy, finite
//! [`ChunkStream`]. The stream ending means completion; an `Err` item means
//! failure. Dropping the stream is the out-of-band cancellation signal: a
//! generator must stop producing once its stream is dropped.
//!
//! [`EchoGenerator`] is the reference implementation served for the `echo`
//! tool. Real model clients live outside this crate.

use crate::types::CallId;
use core::time::Duration;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;

pub type ChunkStream = BoxStream<'static, Result<String, GeneratorError>>;

/// Failures reported by a generator.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub call_id: CallId,
    pub tool: String,
    pub input: Value,
}

pub trait Generator: Send + Sync + 'static {
    /// Starts producing chunks for `request`.
    fn stream(&self, request: GenerationRequest) -> ChunkStream;
}

/// Streams the request text back word by word.
///
/// The text is `input.text`, or else the content of the last `user` entry in
/// `input.messages`.
#[derive(Clone, Debug, Default)]
pub struct EchoGenerator {
    delay: Duration,
}

impl EchoGenerator {
    pub const TOOL: &'static str = "echo";

    /// `delay` is slept before every chunk.
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    fn prompt(input: &Value) -> String {
        if let Some(text) = input.get("text").and_then(Value::as_str) {
            return text.to_owned();
        }
        input
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            })
            .and_then(|m| m.get("content").and_then(Value::as_str))
            .unwrap_or_default()
            .to_owned()
    }
}

impl Generator for EchoGenerator {
    fn stream(&self, request: GenerationRequest) -> ChunkStream {
        if request.tool != Self::TOOL {
            let err = GeneratorError::UnknownTool(request.tool);
            return futures::stream::once(async move { Err(err) }).boxed();
        }

        let chunks: Vec<String> = Self::prompt(&request.input)
            .split_inclusive(char::is_whitespace)
            .map(str::to_owned)
            .collect();
        let delay = self.delay;

        futures::stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            })
            .boxed()
    }
}
