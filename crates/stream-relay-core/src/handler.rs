use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::events::{EventId, EventLog};
use crate::jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JSONRPC_VERSION};
use crate::session::SessionId;

/// Application-side JSON-RPC dispatcher. The transport decides *where* a
/// message goes; implementations decide what it means.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Answer a request. `Err` becomes a JSON-RPC error envelope on the same
    /// request id and leaves the session untouched.
    async fn handle_request(
        &self,
        ctx: &SessionContext,
        request: &JsonRpcRequest,
    ) -> Result<Value, JsonRpcError>;

    async fn handle_notification(
        &self,
        _ctx: &SessionContext,
        _notification: &JsonRpcNotification,
    ) {
    }
}

/// What a handler can see of the session it is serving.
#[derive(Clone)]
pub struct SessionContext {
    session_id: SessionId,
    events: Arc<EventLog>,
}

impl SessionContext {
    pub(crate) fn new(session_id: SessionId, events: Arc<EventLog>) -> Self {
        Self { session_id, events }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Queue a raw JSON-RPC message for the session's event stream.
    pub fn push(&self, message: Value) -> EventId {
        self.events.push(message)
    }

    /// Queue a server notification for the session's event stream.
    pub fn notify(&self, method: &str, params: Option<Value>) -> EventId {
        let mut message = json!({ "jsonrpc": JSONRPC_VERSION, "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        self.push(message)
    }
}
