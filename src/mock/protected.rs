//! Bearer-protected wrapper around the HTTP mock tool server.
//!
//! Every request outside `/.well-known/` requires a bearer token that the
//! designated mock OAuth server accepts for the required scope. A 401
//! carries `WWW-Authenticate: Bearer resource_metadata=…` advertising the
//! protected-resource metadata, which in turn names the issuer, so the
//! aggregator can initiate an authorization flow.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::OAuthError;
use crate::mock::http::{HttpMockState, endpoint_url, mcp_router, serve_router};
use crate::mock::oauth::MockOAuthServer;
use crate::mock::tools::ToolRegistry;
use crate::scenario::schema::TransportKind;

struct ProtectedState {
    oauth: Arc<MockOAuthServer>,
    required_scope: String,
    resource_url: String,
}

/// A running OAuth-protected mock tool server.
pub struct ProtectedMockServer {
    name: String,
    port: u16,
    transport: TransportKind,
    handle: axum_server::Handle<std::net::SocketAddr>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProtectedMockServer {
    /// Starts a protected mock on `port`, validating tokens against `oauth`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::StartFailed`] if the port cannot be served.
    pub fn start(
        registry: ToolRegistry,
        port: u16,
        transport: TransportKind,
        oauth: Arc<MockOAuthServer>,
        required_scope: String,
    ) -> Result<Self, OAuthError> {
        let name = registry.server_name().to_string();
        let resource_url = format!("http://localhost:{port}");
        let protected_state = Arc::new(ProtectedState {
            oauth,
            required_scope,
            resource_url: resource_url.clone(),
        });

        let mcp_state = Arc::new(HttpMockState::new(registry));
        let guarded = mcp_router(mcp_state).layer(from_fn_with_state(
            Arc::clone(&protected_state),
            require_bearer,
        ));
        let router = Router::new()
            .route(
                "/.well-known/oauth-protected-resource",
                get(handle_resource_metadata),
            )
            .with_state(Arc::clone(&protected_state))
            .merge(guarded);

        let (handle, task) = serve_router(router, port)?;
        info!(port, name, "protected mock tool server started");
        Ok(Self {
            name,
            port,
            transport,
            handle,
            task: Mutex::new(Some(task)),
        })
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
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
            warn!(name = %self.name, "protected mock tool server did not stop in time");
        }
    }
}

impl std::fmt::Debug for ProtectedMockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedMockServer")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

async fn require_bearer(
    State(state): State<Arc<ProtectedState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path().starts_with("/.well-known/") {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let reason = match bearer {
        None => "missing bearer token".to_string(),
        Some(token) => match state
            .oauth
            .validate_access_token(token, &state.required_scope)
        {
            Ok(_) => return next.run(request).await,
            Err(reason) => reason,
        },
    };

    debug!(%reason, "rejecting unauthenticated request");
    let challenge = format!(
        "Bearer resource_metadata=\"{}/.well-known/oauth-protected-resource\", error=\"invalid_token\", error_description=\"{reason}\"",
        state.resource_url
    );
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        reason,
    )
        .into_response()
}

async fn handle_resource_metadata(State(state): State<Arc<ProtectedState>>) -> Response {
    Json(json!({
        "resource": state.resource_url,
        "authorization_servers": [state.oauth.issuer()],
        "scopes_supported": [state.required_scope],
        "bearer_methods_supported": ["header"],
    }))
    .into_response()
}
