//! Server-initiated messages for one session: a bounded replay buffer plus a
//! broadcast fan-out to live event streams.

use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Position of an event in a session's log. Ids start at 1, so resuming
/// after `0` replays everything still retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(EventId)
            .map_err(|_| TransportError::InvalidEventId(s.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub id: EventId,
    pub message: Arc<Value>,
}

struct EventLogInner {
    next_id: u64,
    retained: VecDeque<ServerEvent>,
    capacity: usize,
    tx: broadcast::Sender<ServerEvent>,
}

pub struct EventLog {
    inner: Mutex<EventLogInner>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Mutex::new(EventLogInner {
                next_id: 1,
                retained: VecDeque::with_capacity(capacity),
                capacity,
                tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and deliver it to every live stream.
    pub fn push(&self, message: Value) -> EventId {
        let mut inner = self.lock();
        let id = EventId(inner.next_id);
        inner.next_id += 1;

        let event = ServerEvent {
            id,
            message: Arc::new(message),
        };
        if inner.retained.len() >= inner.capacity {
            inner.retained.pop_front();
        }
        inner.retained.push_back(event.clone());

        // No receivers is fine: the event stays in the replay buffer.
        let _ = inner.tx.send(event);
        id
    }

    /// Snapshot the events after `after` and attach a live receiver. Both
    /// happen under one lock so nothing pushed in between is lost or repeated.
    pub fn subscribe(
        &self,
        after: Option<EventId>,
    ) -> Result<(Vec<ServerEvent>, broadcast::Receiver<ServerEvent>), TransportError> {
        let inner = self.lock();
        let replay = match after {
            None => Vec::new(),
            Some(after) if after.0 >= inner.next_id => {
                return Err(TransportError::InvalidEventId(after.to_string()));
            }
            Some(after) => inner
                .retained
                .iter()
                .filter(|event| event.id > after)
                .cloned()
                .collect(),
        };
        Ok((replay, inner.tx.subscribe()))
    }
}

/// A subscriber's view of the event log. Ends when the owning transport
/// closes; runs its release hook when dropped.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = ServerEvent> + Send>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl EventStream {
    pub(crate) fn new(
        replay: Vec<ServerEvent>,
        receiver: broadcast::Receiver<ServerEvent>,
        shutdown: CancellationToken,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        let live = BroadcastStream::new(receiver).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event stream lagged, dropping events");
                    None
                }
            }
        });
        let inner = stream::iter(replay)
            .chain(live)
            .take_until(shutdown.cancelled_owned());

        Self {
            inner: Box::pin(inner),
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Stream for EventStream {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
