//! Two-phase readiness probe for a spawned aggregator.
//!
//! Phase one dials the reserved TCP port until it accepts a connection.
//! Phase two opens an MCP client (authenticated when a pre-generated
//! bearer exists) and polls until every declared resource is observable:
//! tools in `tools/list`, service classes available, services present,
//! workflows listed. The first fully-green cycle wins.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::client::McpTestClient;
use crate::error::InstanceError;

/// Interval between probe cycles.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Phase-one budget: TCP connect.
const PORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Phase-two budget: resource observability.
const RESOURCES_TIMEOUT: Duration = Duration::from_secs(15);

/// Resources the probe must observe before steps run.
#[derive(Debug, Clone, Default)]
pub struct ExpectedResources {
    /// Namespaced tool names (`x_<server>_<tool>`).
    pub tools: Vec<String>,
    /// Service class names that must report `available: true`.
    pub service_classes: Vec<String>,
    /// Service names that must resolve via `core_service_get`.
    pub services: Vec<String>,
    /// Workflow names that must appear in `core_workflow_list`.
    pub workflows: Vec<String>,
}

impl ExpectedResources {
    /// Whether there is anything to wait for beyond the port.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
            && self.service_classes.is_empty()
            && self.services.is_empty()
            && self.workflows.is_empty()
    }
}

/// Waits until the aggregator's port accepts TCP connections.
///
/// # Errors
///
/// Returns [`InstanceError::PortNotReady`] after 60 s.
pub async fn wait_for_port(port: u16) -> Result<(), InstanceError> {
    let deadline = tokio::time::Instant::now() + PORT_TIMEOUT;
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(_) => {
                debug!(port, "aggregator port accepting connections");
                return Ok(());
            }
            Err(e) => trace!(port, error = %e, "port not ready yet"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(InstanceError::PortNotReady {
                port,
                timeout: PORT_TIMEOUT,
            });
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

/// Waits until every expected resource is observable through the client.
///
/// # Errors
///
/// Returns [`InstanceError::ResourcesNotReady`] with a diagnostic list of
/// missing resources after 15 s, or a connect failure wrapped the same
/// way if the probe client cannot complete the handshake.
pub async fn wait_for_resources(
    endpoint: &str,
    bearer: Option<&str>,
    expected: &ExpectedResources,
    debug_client: bool,
) -> Result<(), InstanceError> {
    let mut client = McpTestClient::new(debug_client);
    let connect = match bearer {
        Some(token) => client.connect_with_auth(endpoint, token).await,
        None => client.connect(endpoint).await,
    };
    connect.map_err(|e| InstanceError::ResourcesNotReady {
        timeout: RESOURCES_TIMEOUT,
        missing: vec![format!("probe client connect: {e}")],
    })?;

    if expected.is_empty() {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + RESOURCES_TIMEOUT;
    loop {
        let missing = probe_cycle(&client, expected).await;
        if missing.is_empty() {
            debug!("all expected resources observable");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(InstanceError::ResourcesNotReady {
                timeout: RESOURCES_TIMEOUT,
                missing,
            });
        }
        trace!(?missing, "resources not ready yet");
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

/// One probe cycle; returns the resources still missing.
async fn probe_cycle(client: &McpTestClient, expected: &ExpectedResources) -> Vec<String> {
    let mut missing = Vec::new();

    if !expected.tools.is_empty() {
        match client.list_tools().await {
            Ok(tools) => {
                for tool in &expected.tools {
                    if !tools.contains(tool) {
                        missing.push(format!("tool {tool}"));
                    }
                }
            }
            Err(e) => missing.push(format!("tools/list: {e}")),
        }
    }

    for class in &expected.service_classes {
        let available = client
            .call_tool("core_serviceclass_available", &json!({"name": class}))
            .await
            .is_ok_and(|result| {
                !result.is_error
                    && result
                        .first_text_json()
                        .and_then(|v| v.get("available").cloned())
                        .map_or_else(
                            || result.joined_text().to_lowercase().contains("true"),
                            |v| v == serde_json::Value::Bool(true),
                        )
            });
        if !available {
            missing.push(format!("serviceclass {class}"));
        }
    }

    for service in &expected.services {
        let present = client
            .call_tool("core_service_get", &json!({"name": service}))
            .await
            .is_ok_and(|result| !result.is_error);
        if !present {
            missing.push(format!("service {service}"));
        }
    }

    if !expected.workflows.is_empty() {
        match client.call_tool("core_workflow_list", &json!({})).await {
            Ok(result) if !result.is_error => {
                let text = result.joined_text();
                for workflow in &expected.workflows {
                    if !text.contains(workflow.as_str()) {
                        missing.push(format!("workflow {workflow}"));
                    }
                }
            }
            Ok(_) | Err(_) => {
                for workflow in &expected.workflows {
                    missing.push(format!("workflow {workflow}"));
                }
            }
        }
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_expectations_need_nothing() {
        assert!(ExpectedResources::default().is_empty());
        let expected = ExpectedResources {
            tools: vec!["x_echo_echo_text".to_string()],
            ..Default::default()
        };
        assert!(!expected.is_empty());
    }

    #[tokio::test]
    async fn port_probe_succeeds_against_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_for_port(port).await.unwrap();
    }
}
