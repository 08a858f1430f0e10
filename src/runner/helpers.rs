//! In-process test helper tools.
//!
//! A small set of `test_*` tool names is intercepted before the MCP
//! client is consulted. They manipulate the scenario's own mocks
//! (simulate the browser leg of an OAuth flow, inject tokens, advance the
//! mock clock) or read the aggregator's auth-status resource.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::client::McpTestClient;
use crate::client::result::ToolResult;
use crate::error::HelperError;
use crate::instance::ManagedInstance;
use crate::runner::expect::StepOutcome;

/// Tool names handled in-process.
pub const HELPER_TOOLS: &[&str] = &[
    "test_simulate_oauth_callback",
    "test_inject_token",
    "test_get_oauth_server_info",
    "test_advance_oauth_clock",
    "test_read_auth_status",
];

/// Whether `tool` is a helper handled without the aggregator.
#[must_use]
pub fn is_helper_tool(tool: &str) -> bool {
    HELPER_TOOLS.contains(&tool)
}

/// Invokes a helper tool.
///
/// # Errors
///
/// Returns [`HelperError`] for malformed arguments; flow-level failures
/// are reported inside the returned outcome so expectations can match
/// them.
pub async fn invoke_helper(
    tool: &str,
    args: &Value,
    instance: &ManagedInstance,
    client: &McpTestClient,
) -> Result<StepOutcome, HelperError> {
    match tool {
        "test_simulate_oauth_callback" => simulate_oauth_callback(args, instance, client).await,
        "test_inject_token" => inject_token(args, instance),
        "test_get_oauth_server_info" => get_oauth_server_info(args, instance),
        "test_advance_oauth_clock" => advance_oauth_clock(args, instance),
        "test_read_auth_status" => read_auth_status(args, instance, client).await,
        other => Err(HelperError::InvalidArgs(format!("unknown helper: {other}"))),
    }
}

/// Drives the authorization-code flow end-to-end against the aggregator.
async fn simulate_oauth_callback(
    args: &Value,
    instance: &ManagedInstance,
    client: &McpTestClient,
) -> Result<StepOutcome, HelperError> {
    let server = required_str(args, "server")?;

    let login = client.call_tool("core_auth_login", &json!({"server": server})).await;
    let login_result = match login {
        Ok(result) if !result.is_error => result,
        other => {
            debug!(?other, "core_auth_login unavailable, falling back to token injection");
            return fallback_token_injection(server, instance);
        }
    };

    let Some(auth_url) = extract_url(&login_result) else {
        return Ok(StepOutcome::from_result(ToolResult::error(
            "core_auth_login returned no authorization URL",
        )));
    };
    let parsed = Url::parse(&auth_url)
        .map_err(|e| HelperError::CallbackFailed(format!("bad authorization URL: {e}")))?;

    let query: std::collections::HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let redirect_uri = query
        .get("redirect_uri")
        .ok_or_else(|| HelperError::CallbackFailed("authorization URL lacks redirect_uri".into()))?;
    let client_id = query.get("client_id").cloned().unwrap_or_default();
    let scope = query.get("scope").cloned().unwrap_or_default();
    let state = query.get("state").cloned().unwrap_or_default();

    let origin = format!(
        "{}://{}:{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or("localhost"),
        parsed.port_or_known_default().unwrap_or(443)
    );
    let Some(mock) = instance.oauth_server_by_issuer(&origin) else {
        return Ok(StepOutcome::from_result(ToolResult::error(format!(
            "no mock OAuth server matches issuer {origin}"
        ))));
    };

    // Use muster's own PKCE challenge so its verifier passes at /token.
    let code = mock.generate_auth_code(
        &client_id,
        redirect_uri,
        &scope,
        query.get("code_challenge").map(String::as_str),
        query.get("code_challenge_method").map(String::as_str),
    );

    let callback = format!(
        "{redirect_uri}?code={}&state={}",
        urlencoding::encode(&code),
        urlencoding::encode(&state)
    );
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| HelperError::CallbackFailed(e.to_string()))?;
    let response = http
        .get(&callback)
        .send()
        .await
        .map_err(|e| HelperError::CallbackFailed(format!("callback request failed: {e}")))?;

    let status = response.status();
    let mut outcome = if status.is_success() || status.is_redirection() {
        StepOutcome::from_result(ToolResult::text(json!({
            "server": server,
            "issuer": mock.issuer(),
            "status": status.as_u16(),
        }).to_string()))
    } else {
        let body = response.text().await.unwrap_or_default();
        StepOutcome::from_result(ToolResult::error(format!(
            "callback rejected with {status}: {body}"
        )))
    };
    outcome.status_code = Some(status.as_u16());
    Ok(outcome)
}

/// Fallback when the aggregator's login tool is unavailable: mint a token
/// directly in the mock so protected calls can proceed.
fn fallback_token_injection(
    server: &str,
    instance: &ManagedInstance,
) -> Result<StepOutcome, HelperError> {
    let mock = match instance.oauth_servers() {
        [] => {
            return Ok(StepOutcome::from_result(ToolResult::error(
                "no mock OAuth server available for token injection",
            )));
        }
        [only] => only,
        several => several
            .iter()
            .find(|s| s.name() == server)
            .unwrap_or(&several[0]),
    };
    let code = mock.generate_auth_code(mock.client_id(), "http://localhost/cb", "openid", None, None);
    match mock.simulate_callback(&code) {
        Ok(tokens) => Ok(StepOutcome::from_result(ToolResult::text(
            json!({"injected": true, "access_token": tokens.access_token}).to_string(),
        ))),
        Err(e) => Ok(StepOutcome::from_result(ToolResult::error(e.to_string()))),
    }
}

/// Stores a token directly in the referenced mock's token table.
fn inject_token(args: &Value, instance: &ManagedInstance) -> Result<StepOutcome, HelperError> {
    let server = required_str(args, "server")?;
    let token = required_str(args, "token")?;
    let scope = args.get("scope").and_then(Value::as_str).unwrap_or("openid");
    let expires_in = match args.get("expires_in").and_then(Value::as_str) {
        Some(text) => humantime::parse_duration(text)
            .map_err(|e| HelperError::InvalidArgs(format!("bad expires_in: {e}")))?,
        None => Duration::from_secs(3600),
    };

    let Some(mock) = instance.oauth_server(server) else {
        return Ok(StepOutcome::from_result(ToolResult::error(format!(
            "unknown mock OAuth server: {server}"
        ))));
    };
    let expires_at = mock.clock().now()
        + chrono::TimeDelta::from_std(expires_in).unwrap_or(chrono::TimeDelta::MAX);
    mock.add_token(token, None, scope, mock.client_id(), expires_at);
    Ok(StepOutcome::from_result(ToolResult::text(
        json!({"injected": token, "scope": scope}).to_string(),
    )))
}

/// Reflects issuer URLs and ports of the scenario's OAuth mocks.
fn get_oauth_server_info(
    args: &Value,
    instance: &ManagedInstance,
) -> Result<StepOutcome, HelperError> {
    let filter = args.get("server").and_then(Value::as_str);
    let mut info = serde_json::Map::new();
    for mock in instance.oauth_servers() {
        if filter.is_some_and(|f| f != mock.name()) {
            continue;
        }
        info.insert(
            mock.name().to_string(),
            json!({"issuer": mock.issuer(), "port": mock.port()}),
        );
    }
    if info.is_empty() {
        return Ok(StepOutcome::from_result(ToolResult::error(
            "no matching mock OAuth server",
        )));
    }
    Ok(StepOutcome::from_result(ToolResult::text(
        Value::Object(info).to_string(),
    )))
}

/// Advances the mock clock of one or all OAuth mocks.
fn advance_oauth_clock(
    args: &Value,
    instance: &ManagedInstance,
) -> Result<StepOutcome, HelperError> {
    let duration_text = required_str(args, "duration")?;
    let delta = humantime::parse_duration(duration_text)
        .map_err(|e| HelperError::InvalidArgs(format!("bad duration: {e}")))?;
    let filter = args.get("server").and_then(Value::as_str);

    let mut advanced = Vec::new();
    for mock in instance.oauth_servers() {
        if filter.is_some_and(|f| f != mock.name()) {
            continue;
        }
        if mock.clock().advance(delta).is_ok() {
            advanced.push(mock.name().to_string());
        }
    }
    if advanced.is_empty() {
        return Ok(StepOutcome::from_result(ToolResult::error(
            "no mock OAuth server has a mock clock",
        )));
    }
    Ok(StepOutcome::from_result(ToolResult::text(
        json!({"advanced": advanced, "by": duration_text}).to_string(),
    )))
}

/// Reads the aggregator's `auth://status` resource, optionally filtered
/// to one server entry.
async fn read_auth_status(
    args: &Value,
    _instance: &ManagedInstance,
    client: &McpTestClient,
) -> Result<StepOutcome, HelperError> {
    let status = match client.read_resource("auth://status").await {
        Ok(value) => value,
        Err(e) => return Ok(StepOutcome::from_transport_error(e.to_string())),
    };

    let payload = decode_resource_payload(&status);
    let filtered = match args.get("server").and_then(Value::as_str) {
        Some(server) => filter_server_entry(&payload, server).unwrap_or_else(|| {
            json!({"error": format!("no auth status entry for {server}")})
        }),
        None => payload,
    };
    Ok(StepOutcome::from_result(ToolResult::text(
        filtered.to_string(),
    )))
}

/// Resource results carry `contents[0].text`; fall back to the raw value.
fn decode_resource_payload(resource: &Value) -> Value {
    resource
        .get("contents")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_else(|| resource.clone())
}

fn filter_server_entry(payload: &Value, server: &str) -> Option<Value> {
    let servers = payload.get("servers")?;
    match servers {
        Value::Array(entries) => entries
            .iter()
            .find(|e| e.get("name").and_then(Value::as_str) == Some(server))
            .cloned(),
        Value::Object(map) => map.get(server).cloned(),
        _ => None,
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, HelperError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HelperError::InvalidArgs(format!("missing argument: {key}")))
}

/// Pulls the authorization URL out of a `core_auth_login` result: a JSON
/// field if present, else the first URL-looking token in the text.
fn extract_url(result: &ToolResult) -> Option<String> {
    if let Some(decoded) = result.first_text_json() {
        for key in ["login_url", "auth_url", "authorization_url", "url"] {
            if let Some(url) = decoded.get(key).and_then(Value::as_str) {
                return Some(url.to_string());
            }
        }
    }
    let text = result.joined_text();
    text.split_whitespace()
        .find(|word| word.starts_with("http://") || word.starts_with("https://"))
        .map(|word| word.trim_end_matches(['.', ',', ')']).to_string())
        .or_else(|| {
            warn!("no URL found in core_auth_login response");
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_tool_names_are_recognized() {
        assert!(is_helper_tool("test_advance_oauth_clock"));
        assert!(is_helper_tool("test_simulate_oauth_callback"));
        assert!(!is_helper_tool("core_workflow_list"));
        assert!(!is_helper_tool("x_echo_echo_text"));
    }

    #[test]
    fn extract_url_prefers_json_fields() {
        let result = ToolResult::text(r#"{"login_url": "https://localhost:18120/authorize?x=1"}"#);
        assert_eq!(
            extract_url(&result).unwrap(),
            "https://localhost:18120/authorize?x=1"
        );
    }

    #[test]
    fn extract_url_falls_back_to_text_scan() {
        let result =
            ToolResult::text("Open http://localhost:18121/authorize?client_id=c to continue.");
        assert_eq!(
            extract_url(&result).unwrap(),
            "http://localhost:18121/authorize?client_id=c"
        );
    }

    #[test]
    fn resource_payload_decoding() {
        let raw = json!({"contents": [{"uri": "auth://status", "text": "{\"servers\": []}"}]});
        assert_eq!(decode_resource_payload(&raw), json!({"servers": []}));
        let plain = json!({"servers": [1]});
        assert_eq!(decode_resource_payload(&plain), plain);
    }

    #[test]
    fn server_entry_filter_handles_arrays_and_maps() {
        let array = json!({"servers": [{"name": "a", "ok": true}, {"name": "b"}]});
        assert_eq!(
            filter_server_entry(&array, "a").unwrap(),
            json!({"name": "a", "ok": true})
        );
        assert!(filter_server_entry(&array, "c").is_none());
        let map = json!({"servers": {"a": {"ok": 1}}});
        assert_eq!(filter_server_entry(&map, "a").unwrap(), json!({"ok": 1}));
    }
}
