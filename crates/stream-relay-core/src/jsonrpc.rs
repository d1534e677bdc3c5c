use serde::{Deserialize, Serialize};
use serde_json::Value;

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Implementation-defined server error used for missing or unknown sessions.
pub const SESSION_ERROR: i64 = -32000;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    pub fn method(&self) -> &str {
        match self {
            JsonRpcMessage::Request(req) => &req.method,
            JsonRpcMessage::Notification(notif) => &notif.method,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// Parse a JSON value into a JsonRpcMessage.
/// Presence of "id" field distinguishes Request from Notification.
pub fn parse_message(body: &Value) -> Result<JsonRpcMessage, JsonRpcError> {
    if body.is_array() {
        return Err(JsonRpcError::new(
            INVALID_REQUEST,
            "Invalid Request: batch requests are not supported",
        ));
    }

    let obj = body.as_object().ok_or_else(|| {
        JsonRpcError::new(INVALID_REQUEST, "Invalid Request: expected JSON object")
    })?;

    if !obj.get("method").is_some_and(Value::is_string) {
        return Err(JsonRpcError::new(
            INVALID_REQUEST,
            "Invalid Request: missing method field",
        ));
    }

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(JsonRpcError::new(
            INVALID_REQUEST,
            "Invalid Request: jsonrpc must be \"2.0\"",
        ));
    }

    // Presence of "id" field (even if null) distinguishes Request from Notification
    if obj.contains_key("id") {
        serde_json::from_value::<JsonRpcRequest>(body.clone())
            .map(JsonRpcMessage::Request)
            .map_err(|e| JsonRpcError::new(INVALID_REQUEST, format!("Invalid Request: {}", e)))
    } else {
        serde_json::from_value::<JsonRpcNotification>(body.clone())
            .map(JsonRpcMessage::Notification)
            .map_err(|e| JsonRpcError::new(INVALID_REQUEST, format!("Invalid Request: {}", e)))
    }
}

/// Create a success response with the given id and result.
pub fn success_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.into(),
        id,
        result: Some(result),
        error: None,
    }
}

/// Create an error response with the given id, code, and message.
pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    from_error(id, JsonRpcError::new(code, message))
}

pub fn from_error(id: Value, error: JsonRpcError) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.into(),
        id,
        result: None,
        error: Some(error),
    }
}

/// The envelope returned for a POST that names no live session.
pub fn no_valid_session_response() -> JsonRpcResponse {
    error_response(
        Value::Null,
        SESSION_ERROR,
        "Bad Request: No valid session ID provided",
    )
}
