use futures::FutureExt;
use serde_json::Value;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::events::{EventId, EventLog, EventStream};
use crate::handler::{RequestHandler, SessionContext};
use crate::handshake::INITIALIZE_METHOD;
use crate::jsonrpc::{
    from_error, success_response, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
};
use crate::session::{SessionConfig, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created for a handshake whose initialize request has not been answered yet.
    Uninitialized,
    Active,
    /// Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// DELETE from the client.
    ClientTerminated,
    /// The client's event stream went away and the session is configured to
    /// follow it.
    Disconnected,
    /// Idle longer than the configured timeout.
    Expired,
    /// The handler rejected the initialize request.
    InitializeFailed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientTerminated => "client_terminated",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Expired => "expired",
            CloseReason::InitializeFailed => "initialize_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent exactly once per transport, when it reaches [`TransportState::Closed`].
/// The registry acks after the entry is gone.
#[derive(Debug)]
pub struct SessionClosed {
    pub id: SessionId,
    pub reason: CloseReason,
    pub ack: Option<oneshot::Sender<()>>,
}

/// Per-session state machine. Requests hold a read guard on `state` for
/// their whole duration; transitions take the write guard, so a close waits
/// for in-flight requests and nothing runs against a half-closed transport.
pub struct Transport {
    session_id: SessionId,
    state: RwLock<TransportState>,
    handler: Arc<dyn RequestHandler>,
    events: Arc<EventLog>,
    subscribers: AtomicUsize,
    max_subscribers: usize,
    close_on_disconnect: bool,
    in_flight: AtomicUsize,
    last_activity: Mutex<Instant>,
    shutdown: CancellationToken,
    close_tx: mpsc::UnboundedSender<SessionClosed>,
}

struct ActivityGuard<'a> {
    transport: &'a Transport,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.transport.touch();
    }
}

impl Transport {
    pub(crate) fn new(
        session_id: SessionId,
        handler: Arc<dyn RequestHandler>,
        config: &SessionConfig,
        close_tx: mpsc::UnboundedSender<SessionClosed>,
    ) -> Self {
        Self {
            session_id,
            state: RwLock::new(TransportState::Uninitialized),
            handler,
            events: Arc::new(EventLog::new(config.event_buffer)),
            subscribers: AtomicUsize::new(0),
            max_subscribers: config.max_subscribers.max(1),
            close_on_disconnect: config.close_on_disconnect,
            in_flight: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            close_tx,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn state(&self) -> TransportState {
        *self.state.read().await
    }

    /// Lock-free check, true once closing has begun.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> SessionContext {
        SessionContext::new(self.session_id.clone(), self.events.clone())
    }

    /// Queue a server-initiated message for this session's event stream.
    pub fn push(&self, message: Value) -> EventId {
        self.events.push(message)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn begin_activity(&self) -> ActivityGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard { transport: self }
    }

    /// True if nothing is using the session and it has been quiet for `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        if self.is_closed()
            || self.in_flight.load(Ordering::SeqCst) > 0
            || self.subscriber_count() > 0
        {
            return false;
        }
        let last = *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.elapsed() >= timeout
    }

    async fn call_handler(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let ctx = self.context();
        match AssertUnwindSafe(self.handler.handle_request(&ctx, request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    session_id = %self.session_id,
                    method = %request.method,
                    "Request handler panicked"
                );
                Err(JsonRpcError::internal("Internal error"))
            }
        }
    }

    /// Answer the handshake. Moves `Uninitialized -> Active` on success; a
    /// handler error is returned as an error envelope and closes the session.
    pub async fn initialize(
        &self,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, TransportError> {
        let mut state = self.state.write().await;
        match *state {
            TransportState::Uninitialized => {}
            TransportState::Active => return Err(TransportError::AlreadyInitialized),
            TransportState::Closed => return Err(TransportError::SessionNotFound),
        }

        let result = {
            let _activity = self.begin_activity();
            self.call_handler(request).await
        };

        match result {
            Ok(value) => {
                *state = TransportState::Active;
                info!(session_id = %self.session_id, "Session initialized");
                Ok(success_response(request.id.clone(), value))
            }
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    code = err.code,
                    message = %err.message,
                    "Initialize rejected by handler"
                );
                *state = TransportState::Closed;
                drop(state);
                self.finish_close(CloseReason::InitializeFailed).await;
                Ok(from_error(request.id.clone(), err))
            }
        }
    }

    /// Forward one client message. Requests yield exactly one response,
    /// notifications none.
    pub async fn handle_message(
        &self,
        message: JsonRpcMessage,
    ) -> Result<Option<JsonRpcResponse>, TransportError> {
        let state = self.state.read().await;
        if *state != TransportState::Active {
            return Err(TransportError::SessionNotFound);
        }
        let _activity = self.begin_activity();

        debug!(
            session_id = %self.session_id,
            method = %message.method(),
            "Forwarding message"
        );

        match message {
            JsonRpcMessage::Request(request) => {
                if request.method == INITIALIZE_METHOD {
                    return Err(TransportError::AlreadyInitialized);
                }
                let response = match self.call_handler(&request).await {
                    Ok(result) => success_response(request.id, result),
                    Err(err) => from_error(request.id, err),
                };
                Ok(Some(response))
            }
            JsonRpcMessage::Notification(notification) => {
                let ctx = self.context();
                let outcome =
                    AssertUnwindSafe(self.handler.handle_notification(&ctx, &notification))
                        .catch_unwind()
                        .await;
                if outcome.is_err() {
                    error!(
                        session_id = %self.session_id,
                        method = %notification.method,
                        "Notification handler panicked"
                    );
                }
                Ok(None)
            }
        }
    }

    /// Open a server-push stream, optionally resuming after `last_event_id`.
    pub async fn subscribe(
        self: &Arc<Self>,
        last_event_id: Option<EventId>,
    ) -> Result<EventStream, TransportError> {
        let state = self.state.read().await;
        if *state != TransportState::Active {
            return Err(TransportError::SessionNotFound);
        }

        let max = self.max_subscribers;
        if self
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(TransportError::SubscriberLimit(max));
        }

        let (replay, receiver) = match self.events.subscribe(last_event_id) {
            Ok(parts) => parts,
            Err(err) => {
                self.subscribers.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.touch();
        debug!(
            session_id = %self.session_id,
            replayed = replay.len(),
            "Event stream opened"
        );

        let weak = Arc::downgrade(self);
        Ok(EventStream::new(
            replay,
            receiver,
            self.shutdown.clone(),
            move || release_subscriber(weak),
        ))
    }

    /// DELETE. Fails with `SessionNotFound` if the session was already closed.
    pub async fn terminate(&self) -> Result<(), TransportError> {
        if self.close(CloseReason::ClientTerminated).await {
            Ok(())
        } else {
            Err(TransportError::SessionNotFound)
        }
    }

    /// Move to `Closed`. Returns false if another caller got there first.
    pub async fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.write().await;
            if *state == TransportState::Closed {
                return false;
            }
            *state = TransportState::Closed;
        }
        self.finish_close(reason).await;
        true
    }

    /// Expire the session if it is still idle once no request can be in
    /// flight. Holding the write guard excludes requests and new streams.
    pub async fn close_if_idle(&self, timeout: Duration) -> bool {
        {
            let mut state = self.state.write().await;
            if *state == TransportState::Closed || !self.is_idle(timeout) {
                return false;
            }
            *state = TransportState::Closed;
        }
        self.finish_close(CloseReason::Expired).await;
        true
    }

    async fn finish_close(&self, reason: CloseReason) {
        self.shutdown.cancel();
        info!(session_id = %self.session_id, %reason, "Session closed");

        let (ack_tx, ack_rx) = oneshot::channel();
        let event = SessionClosed {
            id: self.session_id.clone(),
            reason,
            ack: Some(ack_tx),
        };
        if self.close_tx.send(event).is_err() {
            warn!(session_id = %self.session_id, "Session registry is gone, close event dropped");
            return;
        }
        let _ = ack_rx.await;
    }
}

fn release_subscriber(transport: Weak<Transport>) {
    let Some(transport) = transport.upgrade() else {
        return;
    };
    transport.subscribers.fetch_sub(1, Ordering::SeqCst);
    transport.touch();
    debug!(session_id = %transport.session_id, "Event stream released");

    if !transport.close_on_disconnect || transport.is_closed() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                transport.close(CloseReason::Disconnected).await;
            });
        }
        Err(_) => {
            warn!(
                session_id = %transport.session_id,
                "No runtime available to close disconnected session"
            );
        }
    }
}
