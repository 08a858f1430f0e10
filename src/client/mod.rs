//! MCP test client for driving the aggregator (streamable HTTP).
//!
//! Every request carries the client's stable session id in
//! `X-Muster-Session-ID` and, when configured, a bearer token. All tool
//! calls are routed through the aggregator's `call_tool` meta-tool so the
//! server-side dispatch path is exercised; the single-text JSON envelope
//! is unwrapped back into a typed [`ToolResult`].

pub mod jsonrpc;
pub mod result;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::TransportError;
use jsonrpc::{JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
use result::{ToolResult, unwrap_meta_result};

/// Session id header the aggregator uses to bind OAuth state to a client.
pub const SESSION_HEADER: &str = "X-Muster-Session-ID";

/// Timeout for the initialize handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for individual requests once connected.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A tool definition as listed by the aggregator.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    /// Namespaced tool name (e.g. `x_echo_echo_text`).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema for the tool arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

/// Connection state: endpoint and credentials of an established session.
#[derive(Debug, Clone)]
struct Connection {
    endpoint: String,
    bearer: Option<String>,
}

/// MCP test client.
///
/// Constructed `Disconnected`; [`connect`](Self::connect) or
/// [`connect_with_auth`](Self::connect_with_auth) perform the MCP
/// `initialize` handshake. Any failure before the handshake completes
/// leaves the client `Disconnected`.
pub struct McpTestClient {
    http: reqwest::Client,
    session_id: String,
    connection: Option<Connection>,
    next_id: AtomicI64,
    debug: bool,
}

impl McpTestClient {
    /// Creates a disconnected client with a fresh random session id.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed, which
    /// only happens when the TLS backend is unavailable.
    #[must_use]
    pub fn new(debug: bool) -> Self {
        Self::with_session_id(debug, generate_session_id())
    }

    /// Creates a disconnected client with a caller-chosen session id.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed.
    #[must_use]
    pub fn with_session_id(debug: bool, session_id: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction failed");
        Self {
            http,
            session_id,
            connection: None,
            next_id: AtomicI64::new(1),
            debug,
        }
    }

    /// Returns the client's session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns `true` once the initialize handshake has succeeded.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Connects without authentication.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the handshake does not
    /// complete within 30 s; the client stays `Disconnected`.
    pub async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        self.establish(endpoint, None).await
    }

    /// Connects with a bearer token attached to every request.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn connect_with_auth(
        &mut self,
        endpoint: &str,
        bearer: &str,
    ) -> Result<(), TransportError> {
        self.establish(endpoint, Some(bearer.to_string())).await
    }

    /// Closes the current transport and reconnects with a different bearer
    /// while preserving the supplied session id.
    ///
    /// This is the hook for re-authentication-with-same-session tests.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn reconnect_with_session(
        &mut self,
        endpoint: &str,
        bearer: Option<String>,
        session_id: String,
    ) -> Result<(), TransportError> {
        self.connection = None;
        self.session_id = session_id;
        self.establish(endpoint, bearer).await
    }

    async fn establish(
        &mut self,
        endpoint: &str,
        bearer: Option<String>,
    ) -> Result<(), TransportError> {
        self.connection = None;

        let candidate = Connection {
            endpoint: endpoint.to_string(),
            bearer,
        };
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "muster-test", "version": env!("CARGO_PKG_VERSION")},
        });

        let handshake = self.request_on(&candidate, "initialize", Some(params));
        let response = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                message: format!("initialize timed out after {CONNECT_TIMEOUT:?}"),
            })?
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        if let Some(err) = response.error {
            return Err(TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                message: format!("initialize rejected: {} ({})", err.message, err.code),
            });
        }

        // Best-effort initialized notification; servers that ignore it are fine.
        let notify = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        if let Err(e) = self.post_raw(&candidate, &notify).await {
            debug!(error = %e, "initialized notification not accepted");
        }

        debug!(endpoint, session = %self.session_id, "connected");
        self.connection = Some(candidate);
        Ok(())
    }

    /// Calls `tool_name` through the `call_tool` meta-tool and unwraps the
    /// inner result.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] when disconnected;
    /// [`TransportError::MetaTool`] when the meta layer itself errors or
    /// the envelope is malformed; [`TransportError::Request`] /
    /// [`TransportError::Rpc`] for transport-level failures.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        args: &Value,
    ) -> Result<ToolResult, TransportError> {
        let connection = self.connection()?;
        let params = json!({
            "name": "call_tool",
            "arguments": {"name": tool_name, "arguments": args},
        });
        let response = self
            .request_on(connection, "tools/call", Some(params))
            .await?;
        let outer = decode_call_result(response)?;

        if outer.is_error {
            return Err(TransportError::MetaTool(outer.joined_text()));
        }
        let inner = unwrap_meta_result(&outer)?;
        if self.debug {
            debug!(tool = tool_name, is_error = inner.is_error, "tool call completed");
        }
        Ok(inner)
    }

    /// Lists tool names visible on the aggregator.
    ///
    /// # Errors
    ///
    /// Fails when disconnected or when the request fails.
    pub async fn list_tools(&self) -> Result<Vec<String>, TransportError> {
        Ok(self
            .list_tools_with_schemas()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    /// Lists full tool definitions including input schemas.
    ///
    /// # Errors
    ///
    /// Fails when disconnected or when the request fails.
    pub async fn list_tools_with_schemas(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        let connection = self.connection()?;
        let response = self.request_on(connection, "tools/list", None).await?;
        let result = expect_result(response)?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools)
            .map_err(|e| TransportError::Request(format!("malformed tools/list result: {e}")))
    }

    /// Reads a resource by URI.
    ///
    /// # Errors
    ///
    /// Fails when disconnected or when the request fails.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
        let connection = self.connection()?;
        let response = self
            .request_on(connection, "resources/read", Some(json!({"uri": uri})))
            .await?;
        expect_result(response)
    }

    fn connection(&self) -> Result<&Connection, TransportError> {
        self.connection.as_ref().ok_or(TransportError::NotConnected)
    }

    async fn request_on(
        &self,
        connection: &Connection,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&request)
            .map_err(|e| TransportError::Request(format!("serialize failed: {e}")))?;
        let value = self.post_raw(connection, &body).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Request(format!("malformed response: {e}")))
    }

    async fn post_raw(
        &self,
        connection: &Connection,
        body: &Value,
    ) -> Result<Value, TransportError> {
        let mut req = self
            .http
            .post(&connection.endpoint)
            .header(SESSION_HEADER, &self.session_id)
            .json(body);
        if let Some(bearer) = &connection.bearer {
            req = req.bearer_auth(bearer);
        }
        let response = req
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Request(format!(
                "HTTP {status}: {}",
                truncate(&text, 300)
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| TransportError::Request(format!("non-JSON response: {e}")))
    }
}

impl std::fmt::Debug for McpTestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTestClient")
            .field("session_id", &self.session_id)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

/// Decodes a `tools/call` response into the outer [`ToolResult`].
fn decode_call_result(response: JsonRpcResponse) -> Result<ToolResult, TransportError> {
    let result = expect_result(response)?;
    serde_json::from_value(result)
        .map_err(|e| TransportError::MetaTool(format!("malformed call result: {e}")))
}

/// Extracts the result payload, mapping a JSON-RPC error to [`TransportError::Rpc`].
fn expect_result(response: JsonRpcResponse) -> Result<Value, TransportError> {
    if let Some(err) = response.error {
        return Err(TransportError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    response.result.ok_or_else(|| {
        warn!("response carried neither result nor error");
        TransportError::Request("response has neither result nor error".to_string())
    })
}

/// Generates a 16-random-byte session id, hex formatted.
fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_32_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fresh_client_is_disconnected() {
        let client = McpTestClient::new(false);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn calls_fail_when_disconnected() {
        let client = McpTestClient::new(false);
        let err = client.call_tool("x", &json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        let err = client.read_resource("auth://status").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn connect_failure_leaves_client_disconnected() {
        let mut client = McpTestClient::new(false);
        // Nothing listens on this port; reqwest fails fast on connection refused.
        let result = client.connect("http://127.0.0.1:9/mcp").await;
        assert!(result.is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn chosen_session_id_is_kept() {
        let client = McpTestClient::with_session_id(false, "deadbeef".to_string());
        assert_eq!(client.session_id(), "deadbeef");
    }
}
