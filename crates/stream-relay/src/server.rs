use anyhow::{anyhow, Result};
use axum::{
    extract::{Request, State},
    http::{
        header::{HeaderName, HeaderValue, CONTENT_TYPE},
        StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use stream_relay_core::{metrics::SessionMetrics, CloseReason, RequestHandler, SessionManager};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::{Config, ServerConfig};
use crate::mcp::transport::{auth_middleware, handle_delete, handle_get, handle_post};

const STREAM_RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub struct AppError(StatusCode, anyhow::Error);
impl std::error::Error for AppError {}
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, format!("Something went wrong: {}", self.1)).into_response()
    }
}
impl<E> From<(StatusCode, E)> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from((status_code, err): (StatusCode, E)) -> Self {
        Self(status_code, err.into())
    }
}
impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status code: {} {}", self.0, self.1)?;
        Ok(())
    }
}

pub struct Server {
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    cancellation_token: CancellationToken,
    worker_tracker: TaskTracker,
}

impl Server {
    /// Must be called from within a tokio runtime: the session registry and
    /// the idle GC worker are spawned here.
    pub fn new(
        config: Config,
        handler: Arc<dyn RequestHandler>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(SessionMetrics::new()?);
        let sessions = Arc::new(SessionManager::new(config.session.clone(), metrics));
        let worker_tracker = TaskTracker::new();

        if let Some(idle_timeout) = config.session.idle_timeout() {
            tracing::info!(
                idle_timeout_secs = idle_timeout.as_secs(),
                gc_interval_secs = config.server.gc_interval().as_secs(),
                "Idle session GC enabled"
            );
            worker_tracker.spawn(Self::session_gc_worker(
                sessions.clone(),
                idle_timeout,
                config.server.gc_interval(),
                cancellation_token.clone(),
            ));
        }

        Ok(Self {
            sessions,
            handler,
            config: config.server,
            cancellation_token,
            worker_tracker,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Self> {
        Self::new_for_test_with(Config::default())
    }

    #[cfg(test)]
    pub(crate) fn new_for_test_with(config: Config) -> Arc<Self> {
        Arc::new(
            Self::new(
                config,
                Arc::new(crate::mcp::router::DefaultHandler),
                CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn session_gc_worker(
        sessions: Arc<SessionManager>,
        idle_timeout: Duration,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sessions.close_idle(idle_timeout).await;
                }
                _ = cancellation_token.cancelled() => {
                    break;
                }
            };
        }
        tracing::info!("Exiting session gc loop");
    }

    pub async fn version_header_middleware(req: Request, next: Next) -> impl IntoResponse {
        let mut resp = next.run(req).await;
        resp.headers_mut().insert(
            HeaderName::from_static("stream-relay-version"),
            HeaderValue::from_static(STREAM_RELAY_VERSION),
        );
        resp
    }

    pub fn routes(self: &Arc<Self>) -> Router {
        let session_routes = Router::new().route(
            &self.config.path,
            post(handle_post).get(handle_get).delete(handle_delete),
        );

        // Only guard the session route when an API key is configured
        let session_routes = match &self.config.api_key {
            Some(key) => session_routes.layer(middleware::from_fn_with_state(
                key.clone(),
                auth_middleware,
            )),
            None => session_routes,
        };

        Router::new()
            .route("/ready", get(ready))
            .route("/metrics", get(metrics_endpoint))
            .merge(session_routes)
            .with_state(self.clone())
    }

    pub fn app(self: &Arc<Self>) -> Router {
        self.routes()
            .layer(middleware::from_fn(Self::version_header_middleware))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let token = self.cancellation_token.clone();
        let sessions = self.sessions.clone();
        let app = self.app();

        tracing::info!(path = %self.config.path, "Starting HTTP server...");
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                tracing::info!("Waiting for cancellation token...");
                token.cancelled().await;
                // Open event streams only end once their sessions close.
                let closed = sessions.close_all(CloseReason::Shutdown).await;
                tracing::info!(closed, "Sessions closed, starting graceful shutdown");
            })
            .await?;

        tracing::info!("HTTP server stopped, closing session worker tracker...");
        self.worker_tracker.close();
        self.worker_tracker.wait().await;
        tracing::info!("All session workers stopped");

        Ok(())
    }
}

async fn ready() -> Result<Json<Value>, AppError> {
    Ok(Json(json!({"ok": true})))
}

async fn metrics_endpoint(State(server): State<Arc<Server>>) -> Result<Response, AppError> {
    let body = server.sessions.metrics().encode().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            anyhow!("Failed to encode metrics: {}", e),
        )
    })?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::HEADER_SESSION_ID;
    use axum::body::Body;
    use http::Request as HttpRequest;
    use tower::ServiceExt;

    const INITIALIZE_BODY: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post(uri: &str, session_id: Option<&str>, body: &str) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(id) = session_id {
            builder = builder.header(HEADER_SESSION_ID, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn bare(method: &str, uri: &str, session_id: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(id) = session_id {
            builder = builder.header(HEADER_SESSION_ID, id);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn ready_reports_ok_with_version_header() {
        let server = Server::new_for_test();
        let response = server.app().oneshot(bare("GET", "/ready", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["stream-relay-version"],
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(body_text(response).await, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn unsupported_method_is_405() {
        let server = Server::new_for_test();
        let response = server.app().oneshot(bare("PUT", "/mcp", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn session_lifecycle_over_router() {
        let server = Server::new_for_test();
        let app = server.app();

        let response = app.clone().oneshot(post("/mcp", None, INITIALIZE_BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response.headers()[HEADER_SESSION_ID]
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(server.sessions().len(), 1);

        let stream = app
            .clone()
            .oneshot(bare("GET", "/mcp", Some(&session_id)))
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);
        assert_eq!(stream.headers()[CONTENT_TYPE], "text/event-stream");

        let deleted = app
            .clone()
            .oneshot(bare("DELETE", "/mcp", Some(&session_id)))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);
        assert!(server.sessions().is_empty());

        // The open stream ends once its session is gone.
        tokio::time::timeout(Duration::from_secs(5), body_text(stream))
            .await
            .unwrap();

        let after = app
            .oneshot(post("/mcp", Some(&session_id), r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(after).await).unwrap();
        assert_eq!(body["error"]["code"], -32000);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn api_key_guards_session_route_only() {
        let mut config = Config::default();
        config.server.api_key = Some("secret".to_string());
        let server = Server::new_for_test_with(config);
        let app = server.app();

        let missing = app.clone().oneshot(post("/mcp", None, INITIALIZE_BODY)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let mut wrong = post("/mcp", None, INITIALIZE_BODY);
        wrong
            .headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer nope"));
        let wrong = app.clone().oneshot(wrong).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert!(server.sessions().is_empty());

        let mut good = post("/mcp", None, INITIALIZE_BODY);
        good.headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer secret"));
        let good = app.clone().oneshot(good).await.unwrap();
        assert_eq!(good.status(), StatusCode::OK);
        assert_eq!(server.sessions().len(), 1);

        let ready = app.oneshot(bare("GET", "/ready", None)).await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn custom_path_is_served() {
        let mut config = Config::default();
        config.server.path = "/rpc".to_string();
        let server = Server::new_for_test_with(config);
        let app = server.app();

        let response = app.clone().oneshot(post("/rpc", None, INITIALIZE_BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let old = app.oneshot(post("/mcp", None, INITIALIZE_BODY)).await.unwrap();
        assert_eq!(old.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_sessions() {
        let server = Server::new_for_test();
        let app = server.app();

        app.clone().oneshot(post("/mcp", None, INITIALIZE_BODY)).await.unwrap();
        app.clone().oneshot(post("/mcp", Some("bogus"), "{}")).await.unwrap();

        let response = app.oneshot(bare("GET", "/metrics", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("stream_relay_sessions_active 1"));
        assert!(text.contains("stream_relay_sessions_created_total 1"));
        assert!(text.contains("stream_relay_requests_rejected_total{verb=\"post\"} 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_worker_expires_idle_sessions() {
        let mut config = Config::default();
        config.session.idle_timeout_secs = Some(60);
        config.server.gc_interval_secs = 10;
        let server = Server::new_for_test_with(config);

        let response = server.app().oneshot(post("/mcp", None, INITIALIZE_BODY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.sessions().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(server.sessions().len(), 1);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(server.sessions().is_empty());
        assert_eq!(
            server.sessions().metrics().sessions_closed(CloseReason::Expired),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_open_streams() {
        let token = CancellationToken::new();
        let server = Arc::new(
            Server::new(
                Config::default(),
                Arc::new(crate::mcp::router::DefaultHandler),
                token.clone(),
            )
            .unwrap(),
        );
        let app = server.app();

        let response = app.clone().oneshot(post("/mcp", None, INITIALIZE_BODY)).await.unwrap();
        let session_id = response.headers()[HEADER_SESSION_ID]
            .to_str()
            .unwrap()
            .to_string();
        let stream = app
            .oneshot(bare("GET", "/mcp", Some(&session_id)))
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = tokio::spawn(server.clone().serve(listener));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(server.sessions().is_empty());
        assert_eq!(
            server.sessions().metrics().sessions_closed(CloseReason::Shutdown),
            1
        );
        tokio::time::timeout(Duration::from_secs(5), body_text(stream))
            .await
            .unwrap();
    }
}
