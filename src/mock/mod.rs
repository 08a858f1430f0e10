//! Mock collaborators: OAuth identity providers and child tool servers.

pub mod clock;
pub mod http;
pub mod oauth;
pub mod protected;
pub mod stdio;
pub mod tls;
pub mod tools;

use std::time::Duration;

use serde_json::json;

use crate::client::jsonrpc::{
    JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION, error_codes,
};
use tools::ToolRegistry;

/// Dispatches one MCP request against a tool registry.
///
/// Shared by the stdio and HTTP mock servers. The returned delay, if any,
/// is the matched response rule's `delay` and must be slept by the caller
/// before delivering the response.
#[must_use]
pub fn handle_mcp_request(
    registry: &ToolRegistry,
    request: &JsonRpcRequest,
) -> (Option<Duration>, JsonRpcResponse) {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => (
            None,
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": registry.server_name(),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
        ),
        "ping" => (None, JsonRpcResponse::success(id, json!({}))),
        "tools/list" => (None, JsonRpcResponse::success(id, registry.list_payload())),
        "tools/call" => {
            let params = request.params.clone().unwrap_or(json!({}));
            let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
                return (
                    None,
                    JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "missing tool name"),
                );
            };
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            let (delay, result) = registry.evaluate(name, &args);
            let payload = serde_json::to_value(&result).unwrap_or(json!({}));
            (delay, JsonRpcResponse::success(id, payload))
        }
        other => (
            None,
            JsonRpcResponse::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        ),
    }
}
