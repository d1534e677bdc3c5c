use axum::response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response,
};
use futures::StreamExt;
use std::{convert::Infallible, time::Duration};
use stream_relay_core::{EventStream, ServerEvent};

/// SSE event name used for every server-pushed JSON-RPC message.
pub const MESSAGE_EVENT: &str = "message";

pub fn to_sse_event(event: &ServerEvent) -> Event {
    Event::default()
        .event(MESSAGE_EVENT)
        .id(event.id.to_string())
        .data(event.message.to_string())
}

/// Wrap a session's event stream as a long-lived `text/event-stream` response.
pub fn event_stream_response(events: EventStream, keep_alive: Option<Duration>) -> Response {
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    let sse = Sse::new(stream);
    match keep_alive {
        Some(interval) => sse
            .keep_alive(KeepAlive::default().interval(interval))
            .into_response(),
        None => sse.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::router::DefaultHandler;
    use axum::http::header::CONTENT_TYPE;
    use serde_json::json;
    use std::sync::Arc;
    use stream_relay_core::{
        jsonrpc::JsonRpcRequest, metrics::SessionMetrics, CloseReason, SessionConfig,
        SessionManager,
    };

    async fn initialized_session() -> (SessionManager, Arc<stream_relay_core::Session>) {
        let metrics = Arc::new(SessionMetrics::new().unwrap());
        let sessions = SessionManager::new(SessionConfig::default(), metrics);
        let session = sessions.create(Arc::new(DefaultHandler)).unwrap();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: json!(0),
            method: "initialize".into(),
            params: None,
        };
        session.transport().initialize(&request).await.unwrap();
        (sessions, session)
    }

    #[tokio::test]
    async fn encodes_events_with_id_and_message_name() {
        let (_sessions, session) = initialized_session().await;
        let transport = session.transport().clone();
        transport.push(json!({"jsonrpc": "2.0", "method": "notifications/progress"}));
        transport.push(json!({"jsonrpc": "2.0", "method": "notifications/done"}));

        // No Last-Event-ID: only events pushed after subscribing are delivered.
        let stream = transport.subscribe(None).await.unwrap();
        transport.push(json!({"jsonrpc": "2.0", "method": "notifications/live"}));

        let response = event_stream_response(stream, None);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");

        transport.close(CloseReason::Shutdown).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("event: message\n"));
        assert!(text.contains("id: 3\n"));
        assert!(text.contains(r#"data: {"jsonrpc":"2.0","method":"notifications/live"}"#));
        assert!(!text.contains("notifications/done"));
    }

    #[tokio::test]
    async fn resumed_stream_replays_missed_events() {
        let (_sessions, session) = initialized_session().await;
        let transport = session.transport().clone();
        transport.push(json!({"seq": 1}));
        transport.push(json!({"seq": 2}));

        let stream = transport
            .subscribe(Some(stream_relay_core::EventId::new(1)))
            .await
            .unwrap();
        let response = event_stream_response(stream, Some(Duration::from_secs(15)));

        transport.close(CloseReason::Shutdown).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("id: 2\n"));
        assert!(text.contains(r#"data: {"seq":2}"#));
        assert!(!text.contains(r#"data: {"seq":1}"#));
    }
}
