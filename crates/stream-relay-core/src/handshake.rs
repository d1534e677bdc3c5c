//! Recognizes the JSON-RPC `initialize` request that opens a session.

use serde::Deserialize;
use serde_json::Value;

pub const INITIALIZE_METHOD: &str = "initialize";

#[derive(Deserialize)]
enum ProtocolVersion {
    #[serde(rename = "2.0")]
    V2,
}

#[derive(Deserialize)]
enum HandshakeMethod {
    #[serde(rename = "initialize")]
    Initialize,
}

/// Envelope shape of an initialize request. Deserialization fails for any
/// other version tag or method name.
#[derive(Deserialize)]
struct InitializeEnvelope {
    #[allow(dead_code)]
    jsonrpc: ProtocolVersion,
    #[allow(dead_code)]
    method: HandshakeMethod,
}

/// Returns true iff `body` is a JSON-RPC 2.0 request (not a notification)
/// calling `initialize`. Never fails: every other shape is simply not a
/// handshake.
pub fn is_initialize_request(body: &Value) -> bool {
    let Some(obj) = body.as_object() else {
        return false;
    };
    if !obj.contains_key("id") {
        return false;
    }
    InitializeEnvelope::deserialize(body).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_initialize() {
        assert!(is_initialize_request(
            &json!({"jsonrpc": "2.0", "method": "initialize", "id": 1})
        ));
    }

    #[test]
    fn accepts_initialize_with_params_and_string_id() {
        assert!(is_initialize_request(&json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0"}
            }
        })));
    }

    #[test]
    fn rejects_other_methods() {
        assert!(!is_initialize_request(
            &json!({"jsonrpc": "2.0", "method": "ping", "id": 1})
        ));
        assert!(!is_initialize_request(
            &json!({"jsonrpc": "2.0", "method": "Initialize", "id": 1})
        ));
    }

    #[test]
    fn rejects_wrong_or_missing_version() {
        assert!(!is_initialize_request(
            &json!({"jsonrpc": "1.0", "method": "initialize", "id": 1})
        ));
        assert!(!is_initialize_request(
            &json!({"jsonrpc": 2.0, "method": "initialize", "id": 1})
        ));
        assert!(!is_initialize_request(
            &json!({"method": "initialize", "id": 1})
        ));
    }

    #[test]
    fn rejects_notification_shaped_initialize() {
        assert!(!is_initialize_request(
            &json!({"jsonrpc": "2.0", "method": "initialize"})
        ));
    }

    #[test]
    fn rejects_non_object_bodies() {
        for body in [
            json!(null),
            json!("initialize"),
            json!(42),
            json!([{"jsonrpc": "2.0", "method": "initialize", "id": 1}]),
            json!({"jsonrpc": "2.0", "method": 7, "id": 1}),
        ] {
            assert!(!is_initialize_request(&body), "{body} is not a handshake");
        }
    }
}
