use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt, ops::Deref, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::handler::RequestHandler;
use crate::metrics::SessionMetrics;
use crate::transport::{CloseReason, SessionClosed, Transport};

const SESSION_ID_LENGTH: usize = 32;
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// 32 characters from nanoid's URL-safe alphabet, drawn from a CSPRNG.
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(SESSION_ID_LENGTH).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

pub type IdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Server-pushed events retained per session for `Last-Event-ID` resume.
    pub event_buffer: usize,
    /// Concurrent event streams allowed per session.
    pub max_subscribers: usize,
    /// Close sessions that have been idle this long. Unset disables expiry.
    pub idle_timeout_secs: Option<u64>,
    /// Close the session when its event stream disconnects.
    pub close_on_disconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            max_subscribers: 1,
            idle_timeout_secs: None,
            close_on_disconnect: false,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

pub struct Session {
    id: SessionId,
    created_at: Instant,
    transport: Arc<Transport>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}

/// Concurrent map behind the registry. Implementations must not serialize
/// unrelated ids behind one lock.
pub trait SessionTable: Send + Sync + 'static {
    /// Insert unless the id is taken. Returns false on collision.
    fn try_insert(&self, session: Arc<Session>) -> bool;
    fn get(&self, id: &str) -> Option<Arc<Session>>;
    fn remove(&self, id: &str) -> Option<Arc<Session>>;
    fn len(&self) -> usize;
    fn snapshot(&self) -> Vec<Arc<Session>>;
}

impl SessionTable for DashMap<SessionId, Arc<Session>> {
    fn try_insert(&self, session: Arc<Session>) -> bool {
        match self.entry(session.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    fn get(&self, id: &str) -> Option<Arc<Session>> {
        DashMap::get(self, id).map(|entry| entry.value().clone())
    }

    fn remove(&self, id: &str) -> Option<Arc<Session>> {
        DashMap::remove(self, id).map(|(_, session)| session)
    }

    fn len(&self) -> usize {
        DashMap::len(self)
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// The session registry. Entries are inserted by [`SessionManager::create`]
/// and removed only by the close listener, when a transport reports that it
/// has closed.
pub struct SessionManager {
    table: Arc<dyn SessionTable>,
    generate_id: IdGenerator,
    config: SessionConfig,
    metrics: Arc<SessionMetrics>,
    close_tx: mpsc::UnboundedSender<SessionClosed>,
    listener_token: CancellationToken,
}

impl SessionManager {
    /// Spawns the close listener, so this must run inside a Tokio runtime.
    pub fn new(config: SessionConfig, metrics: Arc<SessionMetrics>) -> Self {
        Self::with_table(
            config,
            metrics,
            Arc::new(DashMap::<SessionId, Arc<Session>>::new()),
            Arc::new(SessionId::generate),
        )
    }

    pub fn with_table(
        config: SessionConfig,
        metrics: Arc<SessionMetrics>,
        table: Arc<dyn SessionTable>,
        generate_id: IdGenerator,
    ) -> Self {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let listener_token = CancellationToken::new();
        tokio::spawn(run_close_listener(
            table.clone(),
            close_rx,
            metrics.clone(),
            listener_token.clone(),
        ));

        Self {
            table,
            generate_id,
            config,
            metrics,
            close_tx,
            listener_token,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    /// Allocate a fresh id and register a new, uninitialized session. The
    /// transport is wired to the close listener before it is visible.
    pub fn create(&self, handler: Arc<dyn RequestHandler>) -> Result<Arc<Session>, TransportError> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = (self.generate_id)();
            let transport = Transport::new(
                id.clone(),
                handler.clone(),
                &self.config,
                self.close_tx.clone(),
            );
            let session = Arc::new(Session {
                id: id.clone(),
                created_at: Instant::now(),
                transport: Arc::new(transport),
            });

            if self.table.try_insert(session.clone()) {
                self.metrics.record_session_created();
                debug!(session_id = %id, sessions = self.table.len(), "Session created");
                return Ok(session);
            }
            warn!(attempt, "Session id collision, regenerating");
        }
        Err(TransportError::IdSpaceExhausted(MAX_ID_ATTEMPTS))
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.table.get(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expire sessions that have been idle for at least `timeout`.
    pub async fn close_idle(&self, timeout: Duration) -> usize {
        let mut closed = 0;
        for session in self.table.snapshot() {
            let transport = &session.transport;
            if transport.is_idle(timeout) && transport.close_if_idle(timeout).await {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, remaining = self.len(), "Expired idle sessions");
        }
        closed
    }

    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let sessions = self.table.snapshot();
        let results = futures::future::join_all(
            sessions
                .iter()
                .map(|session| session.transport.close(reason)),
        )
        .await;
        results.into_iter().filter(|closed| *closed).count()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.listener_token.cancel();
    }
}

async fn run_close_listener(
    table: Arc<dyn SessionTable>,
    mut close_rx: mpsc::UnboundedReceiver<SessionClosed>,
    metrics: Arc<SessionMetrics>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = close_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = token.cancelled() => break,
        };

        if let Some(session) = table.remove(&event.id) {
            metrics.record_session_closed(event.reason);
            debug!(
                session_id = %event.id,
                reason = %event.reason,
                age_secs = session.created_at().elapsed().as_secs(),
                remaining = table.len(),
                "Session removed from registry"
            );
        }
        if let Some(ack) = event.ack {
            let _ = ack.send(());
        }
    }
    debug!("Session close listener stopped");
}
