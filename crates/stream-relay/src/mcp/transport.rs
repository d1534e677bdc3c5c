use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::typed_header::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::Value;
use std::sync::Arc;
use stream_relay_core::{
    is_initialize_request,
    jsonrpc::{
        error_response, from_error, no_valid_session_response, parse_message, JsonRpcMessage,
        JsonRpcRequest, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR,
    },
    CloseReason, EventId, Transport, TransportError,
};
use tracing::{debug, error, warn};

use super::sse::event_stream_response;
use crate::server::Server;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";
pub const INVALID_SESSION_MESSAGE: &str = "Invalid or missing session ID";

/// Handle POST: the initialize handshake, or a message for a live session.
pub async fn handle_post(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(session_id) = extract_session_id(&headers) else {
        return handle_handshake(&server, &body).await;
    };

    let Some(session) = server.sessions.lookup(&session_id) else {
        debug!(session_id = %session_id, "POST for unknown session");
        return reject_post(&server);
    };

    let message = match parse_body(&body) {
        Ok(message) => message,
        Err(response) => return response,
    };
    let request_id = match &message {
        JsonRpcMessage::Request(req) => req.id.clone(),
        JsonRpcMessage::Notification(_) => Value::Null,
    };

    match session.transport().handle_message(message).await {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(TransportError::AlreadyInitialized) => (
            StatusCode::BAD_REQUEST,
            Json(error_response(
                request_id,
                INVALID_REQUEST,
                "Invalid Request: Server already initialized",
            )),
        )
            .into_response(),
        Err(err) => {
            debug!(session_id = %session_id, %err, "POST for closed session");
            reject_post(&server)
        }
    }
}

/// Handle GET: open the session's server-push event stream.
pub async fn handle_get(State(server): State<Arc<Server>>, headers: HeaderMap) -> Response {
    let Some(session) = extract_session_id(&headers).and_then(|id| server.sessions.lookup(&id))
    else {
        return reject_plain(&server, "get");
    };

    let last_event_id = match headers.get(HEADER_LAST_EVENT_ID) {
        None => None,
        Some(raw) => match raw.to_str().ok().and_then(|s| s.parse::<EventId>().ok()) {
            Some(id) => Some(id),
            None => {
                return (StatusCode::BAD_REQUEST, "Invalid Last-Event-ID header").into_response();
            }
        },
    };

    match session.transport().subscribe(last_event_id).await {
        Ok(events) => {
            debug!(
                session_id = %session.id(),
                last_event_id = ?last_event_id.map(EventId::get),
                "Event stream opened"
            );
            event_stream_response(events, server.config().sse_keep_alive())
        }
        Err(TransportError::SubscriberLimit(limit)) => (
            StatusCode::CONFLICT,
            format!("Conflict: session already has {} active event stream(s)", limit),
        )
            .into_response(),
        Err(TransportError::InvalidEventId(id)) => (
            StatusCode::BAD_REQUEST,
            format!("Invalid Last-Event-ID: {}", id),
        )
            .into_response(),
        Err(_) => reject_plain(&server, "get"),
    }
}

/// Handle DELETE: terminate the session.
pub async fn handle_delete(State(server): State<Arc<Server>>, headers: HeaderMap) -> Response {
    let Some(session) = extract_session_id(&headers).and_then(|id| server.sessions.lookup(&id))
    else {
        return reject_plain(&server, "delete");
    };

    match session.transport().terminate().await {
        Ok(()) => {
            debug!(session_id = %session.id(), "Session deleted");
            StatusCode::OK.into_response()
        }
        Err(_) => reject_plain(&server, "delete"),
    }
}

/// Bearer-token check for the session route.
pub async fn auth_middleware(
    State(api_key): State<String>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request,
    next: Next,
) -> Response {
    match auth_header {
        Some(TypedHeader(auth)) if auth.token() == api_key => next.run(req).await,
        _ => {
            warn!("Rejected request with missing or invalid bearer token");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

async fn handle_handshake(server: &Arc<Server>, body: &str) -> Response {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return reject_post(server),
    };
    if !is_initialize_request(&value) {
        debug!("POST without session id is not an initialize request");
        return reject_post(server);
    }
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => return reject_post(server),
    };

    let session = match server.sessions.create(server.handler.clone()) {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "Failed to create session");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_response(request.id, INTERNAL_ERROR, err.to_string())),
            )
                .into_response();
        }
    };

    // The id is only handed out in the response, so if this future is
    // dropped mid-initialize nobody could ever DELETE the session.
    let guard = HandshakeGuard::new(session.transport().clone());
    let initialized = session.transport().initialize(&request).await;
    guard.disarm();

    let response = match initialized {
        Ok(response) => response,
        Err(err) => {
            debug!(session_id = %session.id(), %err, "Session closed during initialize");
            return reject_post(server);
        }
    };

    let initialized = response.error.is_none();
    let mut http_response = (StatusCode::OK, Json(response)).into_response();
    if initialized {
        if let Ok(val) = HeaderValue::from_str(session.id()) {
            http_response.headers_mut().insert(HEADER_SESSION_ID, val);
        }
    }
    http_response
}

/// Closes a freshly created session unless the handshake ran to completion.
struct HandshakeGuard {
    transport: Option<Arc<Transport>>,
}

impl HandshakeGuard {
    fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    fn disarm(mut self) {
        self.transport = None;
    }
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        warn!(session_id = %transport.session_id(), "Client went away during initialize");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    transport.close(CloseReason::InitializeFailed).await;
                });
            }
            Err(_) => {
                error!(
                    session_id = %transport.session_id(),
                    "No runtime available to close abandoned session"
                );
            }
        }
    }
}

fn parse_body(body: &str) -> Result<JsonRpcMessage, Response> {
    let value: Value = serde_json::from_str(body).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(error_response(Value::Null, PARSE_ERROR, "Parse error")),
        )
            .into_response()
    })?;

    parse_message(&value).map_err(|err| {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        (StatusCode::BAD_REQUEST, Json(from_error(id, err))).into_response()
    })
}

fn reject_post(server: &Server) -> Response {
    server.sessions.metrics().record_rejected("post");
    (StatusCode::BAD_REQUEST, Json(no_valid_session_response())).into_response()
}

fn reject_plain(server: &Server, verb: &str) -> Response {
    server.sessions.metrics().record_rejected(verb);
    (StatusCode::BAD_REQUEST, INVALID_SESSION_MESSAGE).into_response()
}

/// Extract the mcp-session-id from request headers.
fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
