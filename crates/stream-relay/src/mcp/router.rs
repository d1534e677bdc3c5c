use async_trait::async_trait;
use serde_json::{json, Value};
use stream_relay_core::{
    jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest},
    RequestHandler, SessionContext,
};
use tracing::debug;

pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", LATEST_PROTOCOL_VERSION];

/// Handler served by the binary: the handshake, `ping`, and nothing else.
/// Embedders register their own `RequestHandler` instead.
pub struct DefaultHandler;

#[async_trait]
impl RequestHandler for DefaultHandler {
    async fn handle_request(
        &self,
        ctx: &SessionContext,
        request: &JsonRpcRequest,
    ) -> Result<Value, JsonRpcError> {
        match request.method.as_str() {
            "initialize" => Ok(handle_initialize(ctx, request.params.as_ref())),
            "ping" => Ok(json!({})),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, ctx: &SessionContext, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                debug!(session_id = %ctx.session_id(), "Client finished initialization");
            }
            "notifications/cancelled" => {
                debug!(
                    method = "notifications/cancelled",
                    "Cancellation notification received (no-op)"
                );
            }
            other => {
                debug!(method = other, "Unknown notification received");
            }
        }
    }
}

fn handle_initialize(ctx: &SessionContext, params: Option<&Value>) -> Value {
    let requested = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str);
    let client_name = params
        .and_then(|p| p.get("clientInfo"))
        .and_then(|info| info.get("name"))
        .and_then(Value::as_str);

    // Echo a version we speak, otherwise offer our latest.
    let negotiated = match requested {
        Some(version) if SUPPORTED_PROTOCOL_VERSIONS.contains(&version) => version,
        _ => LATEST_PROTOCOL_VERSION,
    };

    debug!(
        session_id = %ctx.session_id(),
        client_version = ?requested,
        negotiated_version = %negotiated,
        client = ?client_name,
        "Initialize request"
    );

    json!({
        "protocolVersion": negotiated,
        "capabilities": {},
        "serverInfo": {
            "name": "stream-relay",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
