//! HTTP mock tool server.
//!
//! Speaks MCP over streamable HTTP (`POST /mcp`) and, for the SSE
//! variant, `POST /message` plus a `GET /sse` keep-alive stream. Both
//! variants share the same dispatch; which one the aggregator uses is
//! decided by the generated CRD's `spec.type` and `spec.url`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::client::jsonrpc::JsonRpcMessage;
use crate::error::OAuthError;
use crate::mock::handle_mcp_request;
use crate::mock::tools::ToolRegistry;
use crate::scenario::schema::TransportKind;

/// Shared state of an HTTP mock tool server.
pub(crate) struct HttpMockState {
    pub(crate) registry: ToolRegistry,
    sse_tx: tokio::sync::broadcast::Sender<String>,
}

/// A running HTTP mock tool server.
pub struct MockToolHttpServer {
    state: Arc<HttpMockState>,
    port: u16,
    transport: TransportKind,
    handle: axum_server::Handle<std::net::SocketAddr>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockToolHttpServer {
    /// Starts a plain (unprotected) HTTP mock on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::StartFailed`] if the port cannot be served.
    pub fn start(
        registry: ToolRegistry,
        port: u16,
        transport: TransportKind,
    ) -> Result<Self, OAuthError> {
        let state = Arc::new(HttpMockState::new(registry));
        let router = mcp_router(Arc::clone(&state));
        let (handle, task) = serve_router(router, port)?;
        info!(port, "mock tool server started");
        Ok(Self {
            state,
            port,
            transport,
            handle,
            task: Mutex::new(Some(task)),
        })
    }

    /// Server name from the registry.
    #[must_use]
    pub fn name(&self) -> &str {
        self.state.registry.server_name()
    }

    /// Bound port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The URL the generated CRD points the aggregator at.
    #[must_use]
    pub fn url(&self) -> String {
        endpoint_url(self.port, self.transport, false)
    }

    /// Stops the server.
    ///
    /// # Panics
    ///
    /// Panics if the task mutex is poisoned.
    pub async fn stop(&self, timeout: Duration) {
        self.handle.graceful_shutdown(Some(timeout));
        let task = self.task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task
            && tokio::time::timeout(timeout + Duration::from_secs(1), task)
                .await
                .is_err()
        {
            warn!(name = %self.name(), "mock tool server did not stop in time");
        }
    }
}

impl std::fmt::Debug for MockToolHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockToolHttpServer")
            .field("name", &self.name())
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl HttpMockState {
    pub(crate) fn new(registry: ToolRegistry) -> Self {
        let (sse_tx, _) = tokio::sync::broadcast::channel(64);
        Self { registry, sse_tx }
    }
}

/// Builds the MCP endpoint URL for a mock on `port`.
#[must_use]
pub fn endpoint_url(port: u16, transport: TransportKind, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    match transport {
        TransportKind::Sse => format!("{scheme}://localhost:{port}/sse"),
        _ => format!("{scheme}://localhost:{port}/mcp"),
    }
}

/// Builds the shared MCP router (`/mcp`, `/message`, `/sse`).
pub(crate) fn mcp_router(state: Arc<HttpMockState>) -> Router {
    Router::new()
        .route("/mcp", post(handle_post))
        .route("/message", post(handle_post))
        .route("/sse", get(handle_sse))
        .with_state(state)
}

/// Serves a router on `port` with a shutdown handle.
pub(crate) fn serve_router(
    router: Router,
    port: u16,
) -> Result<(axum_server::Handle<std::net::SocketAddr>, JoinHandle<()>), OAuthError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum_server::bind(addr)
            .handle(server_handle)
            .serve(router.into_make_service())
            .await
        {
            warn!(error = %e, "mock tool server exited");
        }
    });
    Ok((handle, task))
}

async fn handle_post(
    State(state): State<Arc<HttpMockState>>,
    body: axum::body::Bytes,
) -> Response {
    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON-RPC: {e}")).into_response();
        }
    };

    match message {
        JsonRpcMessage::Request(request) => {
            let (delay, response) = handle_mcp_request(&state.registry, &request);
            if let Some(delay) = delay {
                debug!(?delay, method = %request.method, "delaying response");
                tokio::time::sleep(delay).await;
            }
            Json(response).into_response()
        }
        JsonRpcMessage::Notification(notification) => {
            debug!(method = %notification.method, "notification accepted");
            StatusCode::ACCEPTED.into_response()
        }
        JsonRpcMessage::Response(_) => {
            (StatusCode::BAD_REQUEST, "unexpected response message").into_response()
        }
    }
}

async fn handle_sse(
    State(state): State<Arc<HttpMockState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.sse_tx.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|result| result.ok().map(|data| Ok(SseEvent::default().data(data))));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tools::ToolSpec;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_state() -> Arc<HttpMockState> {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
name: ping
responses:
  - response: pong
"#,
        )
        .unwrap();
        Arc::new(HttpMockState::new(ToolRegistry::new("svc", vec![tool])))
    }

    #[tokio::test]
    async fn post_invalid_json_returns_400() {
        let app = mcp_router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .body(Body::from("not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn post_tool_call_round_trips() {
        let app = mcp_router(test_state());
        let body = r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"ping","arguments":{}},"id":1}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["result"]["content"][0]["text"], "pong");
    }

    #[tokio::test]
    async fn notification_is_accepted() {
        let app = mcp_router(test_state());
        let body = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn sse_endpoint_returns_200() {
        let app = mcp_router(test_state());
        let req = Request::builder()
            .method("GET")
            .uri("/sse")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn endpoint_urls_by_transport() {
        assert_eq!(
            endpoint_url(8080, TransportKind::StreamableHttp, false),
            "http://localhost:8080/mcp"
        );
        assert_eq!(
            endpoint_url(8080, TransportKind::Sse, false),
            "http://localhost:8080/sse"
        );
    }
}
