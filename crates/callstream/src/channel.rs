//! Per-call, multi-reader event channels.
//!
//! Each call owns one topic: an ordered backlog of [`Event`]s plus a
//! [`Notify`] used to wake readers. Readers hold their own cursor into the
//! backlog, so every [`Subscription`] sees the same sequence regardless of
//! when it attached (broadcast, not work-stealing).
//!
//! ## Backpressure
//!
//! A topic buffers up to `capacity` events. To make room, events that every
//! attached reader has consumed are evicted first. If an attached reader
//! still has the oldest event ahead of it, [`EventHub::publish`] waits until
//! that reader advances or detaches, so no reader attached before the
//! terminal event ever misses one.
//!
//! With no reader attached the topic acts as a replay buffer: the oldest
//! events are evicted and a late subscriber starts at the oldest retained
//! one. Terminal events never wait for space, so a full topic can briefly
//! hold `capacity + 1` events.
//!
//! ## Closing
//!
//! The first terminal event closes the topic. Later publishes are discarded,
//! which is what guarantees that nothing follows a terminal event.

use crate::{
    error::{Error, Result},
    types::{CallId, Event},
};
use core::time::Duration;
use dashmap::DashMap;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque, btree_map::Entry},
    pin::pin,
    sync::Arc,
};
use tokio::{sync::Notify, time::Instant};

/// What a reader gets back from [`Subscription::next`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The next event in production order.
    Event(Event),
    /// Nothing arrived within the timeout. The channel is still open.
    Timeout,
    /// The terminal event was already delivered to this reader.
    Closed,
}

struct Backlog {
    events: VecDeque<Event>,
    /// Sequence number of `events[0]`.
    offset: u64,
    closed: bool,
    /// Cursor positions of attached readers, with multiplicity.
    readers: BTreeMap<u64, usize>,
}

impl Backlog {
    fn end(&self) -> u64 {
        self.offset + self.events.len() as u64
    }

    fn attach(&mut self, cursor: u64) {
        *self.readers.entry(cursor).or_default() += 1;
    }

    fn detach(&mut self, cursor: u64) {
        if let Entry::Occupied(mut readers) = self.readers.entry(cursor) {
            *readers.get_mut() -= 1;
            if *readers.get() == 0 {
                readers.remove();
            }
        }
    }

    /// Whether `events[0]` may be dropped: no attached reader still needs it.
    fn head_consumed(&self) -> bool {
        self.readers
            .first_key_value()
            .is_none_or(|(&slowest, _)| slowest > self.offset)
    }
}

enum Push {
    Accepted,
    Closed,
    Full(Event),
}

struct Topic {
    backlog: Mutex<Backlog>,
    /// Wakes readers when an event is appended.
    notify: Notify,
    /// Wakes publishers when the head of the backlog may have been freed.
    space: Notify,
    capacity: usize,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        Self {
            backlog: Mutex::new(Backlog {
                events: VecDeque::new(),
                offset: 0,
                closed: false,
                readers: BTreeMap::new(),
            }),
            notify: Notify::new(),
            space: Notify::new(),
            capacity,
        }
    }

    fn push(&self, event: Event) -> Push {
        let terminal = event.is_terminal();
        {
            let mut backlog = self.backlog.lock();
            if backlog.closed {
                return Push::Closed;
            }
            while backlog.events.len() >= self.capacity && backlog.head_consumed() {
                backlog.events.pop_front();
                backlog.offset += 1;
            }
            if backlog.events.len() >= self.capacity && !terminal {
                return Push::Full(event);
            }
            backlog.closed = terminal;
            backlog.events.push_back(event);
        }
        self.notify.notify_waiters();
        if terminal {
            // Publishers still waiting for space must now observe the close.
            self.space.notify_waiters();
        }
        Push::Accepted
    }
}

/// Registry of event topics keyed by call.
pub struct EventHub {
    topics: DashMap<CallId, Arc<Topic>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Creates the topic for `call_id`. Opening an existing topic is a no-op.
    pub fn open(&self, call_id: CallId) {
        self.topics
            .entry(call_id)
            .or_insert_with(|| Arc::new(Topic::new(self.capacity)));
    }

    /// Drops the topic for `call_id`. Existing subscriptions keep their view
    /// of the backlog.
    pub fn remove(&self, call_id: &CallId) -> bool {
        self.topics.remove(call_id).is_some()
    }

    /// Appends `event` to the topic of `call_id`, waiting for an attached
    /// reader to free a slot if the backlog is full.
    ///
    /// Never fails: publishing to an unknown or already closed topic is
    /// logged and ignored. Returns whether the event was appended.
    pub async fn publish(&self, call_id: &CallId, event: Event) -> bool {
        let Some(topic) = self.topic(call_id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(%call_id, kind = event.kind(), "Dropping event for unknown call");
            return false;
        };

        let _kind = event.kind();
        let mut event = event;
        loop {
            // Register before pushing so a reader advancing in between is
            // not missed.
            let mut freed = pin!(topic.space.notified());
            freed.as_mut().enable();

            match topic.push(event) {
                Push::Accepted => return true,
                Push::Closed => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        %call_id,
                        kind = _kind,
                        "Dropping event published after terminal"
                    );
                    return false;
                }
                Push::Full(rejected) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(%call_id, "Backlog full, waiting for slowest reader");
                    event = rejected;
                    freed.await;
                }
            }
        }
    }

    /// Appends `event` without waiting.
    ///
    /// Returns `Ok(false)` for unknown or closed topics, and hands a
    /// non-terminal event back as `Err` when the backlog is full. Terminal
    /// events are never refused for lack of space.
    pub fn try_publish(
        &self,
        call_id: &CallId,
        event: Event,
    ) -> core::result::Result<bool, Event> {
        let Some(topic) = self.topic(call_id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(%call_id, kind = event.kind(), "Dropping event for unknown call");
            return Ok(false);
        };
        match topic.push(event) {
            Push::Accepted => Ok(true),
            Push::Closed => Ok(false),
            Push::Full(event) => Err(event),
        }
    }

    /// Attaches a new reader positioned at the oldest retained event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotFound`] if no topic exists for `call_id`.
    pub fn subscribe(&self, call_id: &CallId) -> Result<Subscription> {
        let topic = self
            .topic(call_id)
            .ok_or(Error::CallNotFound { call_id: *call_id })?;
        let cursor = {
            let mut backlog = topic.backlog.lock();
            let cursor = backlog.offset;
            backlog.attach(cursor);
            cursor
        };
        Ok(Subscription {
            call_id: *call_id,
            topic,
            cursor,
            done: false,
        })
    }

    fn topic(&self, call_id: &CallId) -> Option<Arc<Topic>> {
        // Clone the Arc out so the shard lock is released immediately.
        self.topics.get(call_id).map(|topic| Arc::clone(&topic))
    }
}

/// An independent reader of one call's events.
///
/// While attached, the reader holds back eviction of events it has not read
/// yet. Dropping it releases them.
pub struct Subscription {
    call_id: CallId,
    topic: Arc<Topic>,
    cursor: u64,
    done: bool,
}

impl Subscription {
    /// Waits up to `timeout` for the next event.
    ///
    /// Returns [`Delivery::Closed`] immediately once this reader has received
    /// the terminal event.
    pub async fn next(&mut self, timeout: Duration) -> Delivery {
        let deadline = Instant::now() + timeout;
        let topic = Arc::clone(&self.topic);

        loop {
            // Register interest before checking the backlog so a publish in
            // between is not missed.
            let mut notified = pin!(topic.notify.notified());
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next() {
                return delivery;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Delivery::Timeout;
            }
        }
    }

    /// Returns the next event without waiting, or `None` if the reader is
    /// caught up on an open topic.
    pub fn try_next(&mut self) -> Option<Delivery> {
        if self.done {
            return Some(Delivery::Closed);
        }

        let mut backlog = self.topic.backlog.lock();
        if self.cursor < backlog.end() {
            // Attached readers are never evicted past, so the cursor is
            // always within the retained backlog.
            let index = (self.cursor - backlog.offset) as usize;
            let event = backlog.events[index].clone();
            let was_head = self.cursor == backlog.offset;
            backlog.detach(self.cursor);
            self.cursor += 1;
            backlog.attach(self.cursor);
            drop(backlog);

            if was_head {
                self.topic.space.notify_waiters();
            }
            self.done = event.is_terminal();
            return Some(Delivery::Event(event));
        }

        if backlog.closed {
            drop(backlog);
            self.done = true;
            return Some(Delivery::Closed);
        }

        None
    }

    /// Turns this reader into a stream that ends after the terminal event.
    ///
    /// If no event arrives within `idle_timeout`, the stream yields a single
    /// [`Error::StreamTimeout`] and ends. The call itself keeps running.
    pub fn into_stream(self, idle_timeout: Duration) -> BoxStream<'static, Result<Event>> {
        futures::stream::unfold(Some(self), move |state| async move {
            let mut subscription = state?;
            match subscription.next(idle_timeout).await {
                Delivery::Event(event) => Some((Ok(event), Some(subscription))),
                Delivery::Closed => None,
                Delivery::Timeout => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(call_id = %subscription.call_id, "Stream idle timeout");
                    let err = Error::StreamTimeout {
                        call_id: subscription.call_id,
                        idle: idle_timeout,
                    };
                    Some((Err(err), None))
                }
            }
        })
        .boxed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topic.backlog.lock().detach(self.cursor);
        self.topic.space.notify_waiters();
    }
}
