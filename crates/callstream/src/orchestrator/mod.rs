//! Drives calls from submission to a terminal state.
//!
//! [`Orchestrator`] owns the five stores and coordinates them. Store methods
//! copy what they need out and release their shard before returning, with
//! one exception: a call's session entries are appended while its record is
//! locked, so they always follow the order of its status changes.
//!
//! ## Lifecycle
//!
//! ```text
//! submit() ──► reserve an in-flight slot
//!          ──► CallStore::create (pending)
//!          ──► EventHub::open
//!          ──► IdempotencyIndex::register / rebind
//!          ──► CancellationRegistry::register
//!          ──► spawn execute()
//!
//! execute() ──► transition(running) + session: tool_started
//!           ──► generator chunks ──► publish(partial)*
//!           ──► finalize(finished | error)
//!
//! cancel()  ──► CancellationRegistry::cancel ──► finalize(cancelled)
//! ```
//!
//! ## Terminal bookkeeping
//!
//! Every path that ends a call goes through `finalize`, which first attempts
//! the terminal transition on the [`CallStore`]. Only the path whose
//! transition succeeds appends the session entry, publishes the terminal
//! event, refreshes the idempotency cache, unregisters the cancellation
//! handle and releases the in-flight slot. The losing path does nothing, so exactly one terminal event is
//! ever published per call and the handle is unregistered exactly once.
//!
//! A running call that observes its cancellation token simply stops reading
//! from the generator. The canceller that signalled the token performs the
//! bookkeeping.

use crate::{
    cancel::CancellationRegistry,
    channel::{EventHub, Subscription},
    config::OrchestratorConfig,
    error::{Error, Result},
    generator::{GenerationRequest, Generator, GeneratorError},
    idempotency::IdempotencyIndex,
    session::{SessionEntry, SessionEventKind, SessionLog},
    store::{CallStore, Transition},
    types::{Call, CallId, CallStatus, Event, Submission},
};
use core::{
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use futures::{FutureExt, StreamExt, stream::BoxStream};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

#[cfg(test)]
mod tests;

/// Message carried by `cancelled` events produced by [`Orchestrator::cancel`].
pub const CANCELLED_BY_CLIENT: &str = "cancelled by client";
/// Message carried by `cancelled` events produced by
/// [`Orchestrator::cancel_all`] and shutdown.
pub const CANCELLED_BY_SERVER: &str = "cancelled by server";

/// A request to start a call.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub tool: String,
    pub input: Value,
    pub session_id: Option<String>,
    /// Caller-supplied idempotency token. Empty keys are treated as absent.
    pub dedup_key: Option<String>,
}

impl SubmitRequest {
    pub fn new(tool: impl Into<String>, input: Value) -> Self {
        Self {
            tool: tool.into(),
            input,
            session_id: None,
            dedup_key: None,
        }
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// How a call ended.
enum Outcome {
    Completed(String),
    Failed(String),
    Cancelled(&'static str),
}

impl Outcome {
    fn transition(&self) -> Transition {
        match self {
            Self::Completed(text) => Transition::Finished {
                result: text.clone(),
            },
            Self::Failed(message) => Transition::Failed {
                error: message.clone(),
            },
            Self::Cancelled(_) => Transition::Cancelled,
        }
    }

    fn event(&self) -> Event {
        match self {
            Self::Completed(text) => Event::Final { text: text.clone() },
            Self::Failed(message) => Event::Error {
                message: message.clone(),
            },
            Self::Cancelled(message) => Event::Cancelled {
                message: (*message).to_owned(),
            },
        }
    }

    fn session_entry(&self, call: &Call) -> SessionEntry {
        let (kind, payload) = match self {
            Self::Completed(text) => (
                SessionEventKind::ToolFinished,
                json!({ "tool": call.tool, "output": text }),
            ),
            Self::Failed(message) => (
                SessionEventKind::ToolError,
                json!({ "tool": call.tool, "error": message }),
            ),
            Self::Cancelled(message) => (
                SessionEventKind::ToolCancelled,
                json!({ "message": message }),
            ),
        };
        SessionEntry::new(call.id, kind, payload)
    }
}

struct Inner {
    config: OrchestratorConfig,
    calls: CallStore,
    channels: EventHub,
    dedup: IdempotencyIndex,
    sessions: SessionLog,
    cancellations: CancellationRegistry,
    generator: Arc<dyn Generator>,
    tasks: TaskTracker,
    shutting_down: AtomicBool,
    /// Calls admitted and not yet terminal.
    inflight: AtomicUsize,
}

/// Entry point of the core. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Builds an orchestrator serving calls with `generator`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `config` fails validation.
    pub fn new(config: OrchestratorConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        config.validate()?;
        let inner = Inner {
            calls: CallStore::new(),
            channels: EventHub::new(config.channel_capacity),
            dedup: IdempotencyIndex::new(),
            sessions: SessionLog::new(config.session_capacity),
            cancellations: CancellationRegistry::new(),
            generator,
            tasks: TaskTracker::new(),
            shutting_down: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Starts a call, or returns the existing one for a known deduplication
    /// key. Never waits for the call to make progress.
    ///
    /// A key whose call ended in `error` is released: the next submission
    /// with that key starts a fresh call and rebinds the key to it. Keys of
    /// calls that finished or were cancelled keep returning those calls.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) began.
    /// - [`Error::InvalidRequest`] if the tool name is empty.
    /// - [`Error::ServiceOverloaded`] if the in-flight limit is reached.
    #[cfg_attr(feature = "tracing", tracing::instrument(
        skip_all,
        fields(tool = %request.tool, session_id = ?request.session_id, dedup_key = ?request.dedup_key)
    ))]
    pub fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }
        if request.tool.trim().is_empty() {
            return Err(Error::InvalidRequest {
                reason: "Tool name must not be empty".to_string(),
            });
        }

        let SubmitRequest {
            tool,
            input,
            session_id,
            dedup_key,
        } = request;
        let dedup_key = dedup_key.filter(|key| !key.is_empty());

        loop {
            let mut previous = None;
            if let Some(key) = dedup_key.as_deref() {
                if let Some(entry) = inner.dedup.lookup(key) {
                    let status = inner.calls.status(&entry.call_id).unwrap_or(entry.status);
                    if status != CallStatus::Error {
                        #[cfg(feature = "tracing")]
                        tracing::info!(call_id = %entry.call_id, %status, "Idempotent submit");
                        return Ok(Submission {
                            call_id: entry.call_id,
                            status,
                            deduplicated: true,
                        });
                    }
                    previous = Some(entry.call_id);
                }
            }

            let max = inner.config.max_inflight_calls;
            let reserved = inner
                .inflight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                });
            if let Err(current) = reserved {
                return Err(Error::ServiceOverloaded {
                    details: format!("{current} calls in flight (max {max})"),
                });
            }

            let call_id = inner.calls.create(
                tool.clone(),
                input.clone(),
                session_id.clone(),
                dedup_key.clone(),
            );
            inner.channels.open(call_id);

            // The key is bound before the call becomes cancellable, so a
            // call that loses the race was never visible to anyone.
            if let Some(key) = dedup_key.as_deref() {
                let bound = match previous {
                    Some(failed) => inner.dedup.rebind(key, failed, call_id),
                    None => inner.dedup.register(key, call_id),
                };
                if let Err(_e) = bound {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Lost deduplication race: {_e}");
                    inner.channels.remove(&call_id);
                    inner.calls.discard(&call_id);
                    inner.inflight.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
            }

            let token = CancellationToken::new();
            inner.cancellations.register(call_id, token.clone());
            self.spawn(call_id, token);

            #[cfg(feature = "tracing")]
            tracing::info!(%call_id, "Call started");
            return Ok(Submission {
                call_id,
                status: CallStatus::Pending,
                deduplicated: false,
            });
        }
    }

    fn spawn(&self, call_id: CallId, token: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let fut = async move { inner.execute(call_id, token).await };

        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::info_span!("call", %call_id))
        };

        self.inner.tasks.spawn(fut);
    }

    /// Cancels a non-terminal call.
    ///
    /// Returns `true` if this request moved the call to `cancelled`, and
    /// `false` if the call had already ended (including the case where it
    /// finished while the cancellation was being delivered).
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotFound`] for unknown calls.
    pub fn cancel(&self, call_id: &CallId) -> Result<bool> {
        let inner = &self.inner;
        let status = inner
            .calls
            .status(call_id)
            .ok_or(Error::CallNotFound { call_id: *call_id })?;
        if status.is_terminal() {
            return Ok(false);
        }
        if !inner.cancellations.cancel(call_id) {
            return Ok(false);
        }

        let cancelled = inner.finalize(call_id, &Outcome::Cancelled(CANCELLED_BY_CLIENT));
        #[cfg(feature = "tracing")]
        tracing::info!(%call_id, cancelled, "Cancel requested");
        Ok(cancelled)
    }

    /// Cancels every non-terminal call and returns the ones this sweep
    /// moved to `cancelled`.
    pub fn cancel_all(&self) -> Vec<CallId> {
        let inner = &self.inner;
        let cancelled: Vec<_> = inner
            .cancellations
            .cancel_all()
            .into_iter()
            .filter(|call_id| inner.finalize(call_id, &Outcome::Cancelled(CANCELLED_BY_SERVER)))
            .collect();

        #[cfg(feature = "tracing")]
        tracing::info!(count = cancelled.len(), "Cancel all requested");
        cancelled
    }

    /// Snapshot of a call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotFound`] for unknown calls.
    pub fn get_call(&self, call_id: &CallId) -> Result<Call> {
        self.inner.calls.get(call_id)
    }

    /// The session window, oldest first.
    pub fn read_session(&self, session_id: &str) -> Vec<SessionEntry> {
        self.inner.sessions.read(session_id)
    }

    /// Attaches a reader to the call's events, starting at the oldest
    /// retained event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotFound`] for unknown calls.
    pub fn subscribe(&self, call_id: &CallId) -> Result<Subscription> {
        self.inner.channels.subscribe(call_id)
    }

    /// Streams the call's events until the terminal one, replaying what was
    /// already produced. Each call returns an independent stream.
    ///
    /// The stream yields [`Error::StreamTimeout`] and ends if no event
    /// arrives within the configured idle timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotFound`] for unknown calls.
    pub fn subscribe_and_drain(&self, call_id: &CallId) -> Result<BoxStream<'static, Result<Event>>> {
        let subscription = self.subscribe(call_id)?;
        #[cfg(feature = "tracing")]
        tracing::info!(%call_id, "Stream opened");
        Ok(subscription.into_stream(self.inner.config.stream_idle_timeout))
    }

    /// Number of calls that have not reached a terminal state.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Gracefully shuts the orchestrator down.
    ///
    /// - Refuses new submissions.
    /// - Waits up to the configured shutdown timeout for in-flight calls to
    ///   finish on their own.
    /// - Cancels whatever is left.
    /// - Waits (up to 3 seconds) for the call tasks to exit.
    ///
    /// Returns the calls that had to be cancelled.
    pub async fn shutdown(&self) -> Vec<CallId> {
        let inner = &self.inner;

        // === Phase 0: Stop accepting new calls ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new calls");
        inner.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Let in-flight calls drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight calls ({} active)", self.inflight());
        let drain_result = timeout(inner.config.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if drain_result.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Graceful drain timed out ({} calls still active)",
                self.inflight()
            );
        }

        // === Phase 2: Cancel any remaining calls ===
        let cancelled = self.cancel_all();

        // === Phase 3: Wait for call tasks to exit ===
        inner.tasks.close();
        if timeout(Duration::from_secs(3), inner.tasks.wait())
            .await
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!("Call tasks did not exit within 3s");
        }

        #[cfg(feature = "tracing")]
        tracing::info!(cancelled = cancelled.len(), "Orchestrator shutdown complete");
        cancelled
    }
}

impl Inner {
    /// Body of a spawned call.
    async fn execute(&self, call_id: CallId, token: CancellationToken) {
        if token.is_cancelled() {
            return;
        }

        let started = self
            .calls
            .transition_with(&call_id, Transition::Running, |call| {
                if let Some(session_id) = call.session_id.as_deref() {
                    self.sessions.append(
                        session_id,
                        SessionEntry::new(
                            call_id,
                            SessionEventKind::ToolStarted,
                            json!({ "tool": call.tool, "input": call.input }),
                        ),
                    );
                }
            });
        let call = match started {
            Ok(call) => call,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Call ended before it started: {_e}");
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!(tool = %call.tool, "Tool running");

        let result = AssertUnwindSafe(self.drive(&call, &token))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(GeneratorError::Failed("generator panicked".into()).into()));

        let outcome = match result {
            Ok(Some(text)) => Outcome::Completed(text),
            Ok(None) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Tool task observed cancellation");
                return;
            }
            Err(Error::GeneratorFailure(e)) => Outcome::Failed(e.to_string()),
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.finalize(&call_id, &outcome);
    }

    /// Pulls chunks until the generator completes, fails or the token fires.
    ///
    /// Returns `Ok(None)` when cancelled. Dropping the chunk stream on return
    /// tells the generator to stop.
    async fn drive(&self, call: &Call, token: &CancellationToken) -> Result<Option<String>> {
        if token.is_cancelled() {
            return Ok(None);
        }
        let mut chunks = self.generator.stream(GenerationRequest {
            call_id: call.id,
            tool: call.tool.clone(),
            input: call.input.clone(),
        });
        let mut text = String::new();
        let mut _count = 0_usize;

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(None),
                next = chunks.next() => next,
            };

            let Some(chunk) = next else {
                #[cfg(feature = "tracing")]
                tracing::debug!(chunks = _count, chars = text.len(), "Generator completed");
                return Ok(Some(text));
            };
            let chunk = chunk?;

            // A chunk that raced with the signal is not published.
            if token.is_cancelled() {
                return Ok(None);
            }
            text.push_str(&chunk);
            _count += 1;

            // Publishing may wait on a slow reader; stay responsive to the
            // signal while it does.
            let publish = self.channels.publish(&call.id, Event::Partial { text: chunk });
            let published = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(None),
                published = publish => published,
            };
            if !published {
                // The topic closed, so another path already ended the call.
                return Ok(None);
            }
        }
    }

    /// Records the terminal state if no other path got there first. Returns
    /// whether this path won.
    fn finalize(&self, call_id: &CallId, outcome: &Outcome) -> bool {
        let ended = self
            .calls
            .transition_with(call_id, outcome.transition(), |call| {
                if let Some(session_id) = call.session_id.as_deref() {
                    self.sessions.append(session_id, outcome.session_entry(call));
                }
            });
        let call = match ended {
            Ok(call) => call,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Terminal state already recorded: {_e}");
                return false;
            }
        };

        // Terminal events are never refused for lack of space.
        let _ = self.channels.try_publish(call_id, outcome.event());
        if let Some(key) = call.dedup_key.as_deref() {
            self.dedup.update_status(key, *call_id, call.status);
        }
        self.cancellations.unregister(call_id);
        self.inflight.fetch_sub(1, Ordering::AcqRel);

        #[cfg(feature = "tracing")]
        match outcome {
            Outcome::Completed(text) => {
                tracing::info!(%call_id, chars = text.len(), "Tool finished");
            }
            Outcome::Failed(message) => {
                tracing::warn!(%call_id, "Tool execution failed: {message}");
            }
            Outcome::Cancelled(message) => {
                tracing::info!(%call_id, "Tool cancelled: {message}");
            }
        }
        true
    }
}
