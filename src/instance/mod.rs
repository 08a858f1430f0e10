//! Managed aggregator instances: one per scenario, fully isolated.
//!
//! Setup order: reserve port → start mock OAuth servers → start mock tool
//! servers → materialize the config tree → spawn the aggregator in a new
//! process group → probe readiness. Teardown runs in exact reverse and is
//! unconditional: every resource an instance owns is released even when
//! setup failed halfway.

pub mod config_tree;
pub mod logs;
pub mod ports;
pub mod process;
pub mod readiness;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, InstanceError, OAuthError};
use crate::mock::http::MockToolHttpServer;
use crate::mock::oauth::{MockOAuthServer, OAuthServerConfig};
use crate::mock::protected::ProtectedMockServer;
use crate::mock::tools::{MockServerConfig, ToolRegistry};
use crate::scenario::schema::{McpServerSpec, Scenario, TransportKind};
use config_tree::{ChildEndpoint, ConfigTree, CrdKind, OAuthBlock, ServerIdp};
use logs::{LogCapture, LogSnapshot};
use ports::PortBroker;
use readiness::ExpectedResources;

/// Budget for a mock's own readiness probe.
const MOCK_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period before SIGKILL during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Stop budget per mock during teardown.
const MOCK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Harness-wide settings every instance inherits.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    /// Base of the port pool.
    pub base_port: u16,
    /// Aggregator binary to spawn.
    pub muster_binary: String,
    /// Retain per-instance config trees after teardown.
    pub keep_temp_config: bool,
    /// Extra diagnostics; also retains config trees.
    pub debug: bool,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            base_port: 18000,
            muster_binary: std::env::var("MUSTER_TEST_BINARY")
                .unwrap_or_else(|_| "muster".to_string()),
            keep_temp_config: false,
            debug: false,
        }
    }
}

/// A setup failure together with whatever logs the aggregator produced.
#[derive(Debug)]
pub struct SetupFailure {
    /// The underlying error.
    pub error: HarnessError,
    /// Aggregator logs captured before teardown, if the process started.
    pub logs: Option<LogSnapshot>,
}

/// Everything one scenario's aggregator instance owns.
pub struct ManagedInstance {
    /// Unique instance id (`test-<scenario>-<n>`).
    pub id: String,
    /// Reserved aggregator port.
    pub port: u16,
    /// MCP endpoint (`http://localhost:<port>/mcp`).
    pub endpoint: String,
    /// When setup began.
    pub started_at: Instant,
    /// Resources the readiness probe gates on.
    pub expected: ExpectedResources,
    /// Pre-generated bearer for aggregators that require auth.
    pub bearer_token: Option<String>,
    config_tree: ConfigTree,
    oauth_servers: Vec<Arc<MockOAuthServer>>,
    tool_servers: Vec<MockToolHttpServer>,
    protected_servers: Vec<ProtectedMockServer>,
    process: Option<Child>,
    log_capture: Option<LogCapture>,
    reserved_ports: Vec<u16>,
}

impl ManagedInstance {
    /// Looks up an owned mock OAuth server by declared name.
    #[must_use]
    pub fn oauth_server(&self, name: &str) -> Option<&Arc<MockOAuthServer>> {
        self.oauth_servers.iter().find(|s| s.name() == name)
    }

    /// All owned mock OAuth servers.
    #[must_use]
    pub fn oauth_servers(&self) -> &[Arc<MockOAuthServer>] {
        &self.oauth_servers
    }

    /// Finds the mock OAuth server whose issuer host:port matches `url`.
    #[must_use]
    pub fn oauth_server_by_issuer(&self, url: &str) -> Option<&Arc<MockOAuthServer>> {
        self.oauth_servers
            .iter()
            .find(|s| url.starts_with(s.issuer()) || s.issuer().starts_with(url))
    }

    /// Current aggregator log snapshot, when the process was spawned.
    #[must_use]
    pub fn logs_snapshot(&self) -> Option<LogSnapshot> {
        self.log_capture.as_ref().map(LogCapture::snapshot)
    }
}

impl std::fmt::Debug for ManagedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedInstance")
            .field("id", &self.id)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Creates and destroys managed instances.
pub struct InstanceManager {
    broker: PortBroker,
    settings: HarnessSettings,
    counter: AtomicU64,
    /// Live instances: id → aggregator port. Concurrent workers insert
    /// and remove without contending on a manager-wide lock.
    live: DashMap<String, u16>,
}

impl InstanceManager {
    /// Creates a manager with its own port pool.
    #[must_use]
    pub fn new(settings: HarnessSettings) -> Self {
        Self {
            broker: PortBroker::new(settings.base_port),
            settings,
            counter: AtomicU64::new(1),
            live: DashMap::new(),
        }
    }

    /// Harness settings.
    #[must_use]
    pub const fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Ports of currently live instances, for isolation diagnostics.
    #[must_use]
    pub fn live_ports(&self) -> Vec<u16> {
        self.live.iter().map(|entry| *entry.value()).collect()
    }

    /// Runs the full setup sequence for `scenario`.
    ///
    /// On failure everything created so far is torn down and the captured
    /// aggregator logs (if the process got as far as starting) are
    /// returned alongside the error.
    ///
    /// # Errors
    ///
    /// Returns [`SetupFailure`] for any setup step that fails.
    pub async fn create(&self, scenario: &Scenario) -> Result<ManagedInstance, SetupFailure> {
        let id = format!(
            "test-{}-{}",
            sanitize(&scenario.name),
            self.counter.fetch_add(1, Ordering::SeqCst)
        );

        let port = match self.broker.reserve(&id) {
            Ok(port) => port,
            Err(e) => {
                return Err(SetupFailure {
                    error: e.into(),
                    logs: None,
                });
            }
        };

        let config_tree = match ConfigTree::create(&id) {
            Ok(tree) => tree,
            Err(e) => {
                let _ = self.broker.release(port, &id);
                return Err(SetupFailure {
                    error: e.into(),
                    logs: None,
                });
            }
        };

        let mut instance = ManagedInstance {
            id: id.clone(),
            port,
            endpoint: format!("http://localhost:{port}/mcp"),
            started_at: Instant::now(),
            expected: ExpectedResources::default(),
            bearer_token: None,
            config_tree,
            oauth_servers: Vec::new(),
            tool_servers: Vec::new(),
            protected_servers: Vec::new(),
            process: None,
            log_capture: None,
            reserved_ports: vec![port],
        };

        match self.setup(scenario, &mut instance).await {
            Ok(()) => {
                info!(id = %instance.id, port, "instance ready");
                self.live.insert(instance.id.clone(), instance.port);
                Ok(instance)
            }
            Err(error) => {
                warn!(id = %instance.id, %error, "instance setup failed, tearing down");
                let logs = self.teardown(instance).await;
                Err(SetupFailure {
                    error,
                    logs: Some(logs),
                })
            }
        }
    }

    /// Destroys an instance in reverse setup order, returning its final
    /// aggregator logs.
    pub async fn destroy(&self, instance: ManagedInstance) -> LogSnapshot {
        debug!(id = %instance.id, "destroying instance");
        self.live.remove(&instance.id);
        self.teardown(instance).await
    }

    async fn setup(
        &self,
        scenario: &Scenario,
        instance: &mut ManagedInstance,
    ) -> Result<(), HarnessError> {
        let pre = scenario.pre_configuration.clone().unwrap_or_default();

        // Mock OAuth servers first: protected tool mocks and the config
        // tree both reference them.
        for spec in &pre.oauth_servers {
            let mock_port = self.broker.reserve(&instance.id)?;
            instance.reserved_ports.push(mock_port);
            let server =
                MockOAuthServer::start(OAuthServerConfig::from_spec(spec), mock_port).await?;
            wait_for_oauth_discovery(&server).await?;
            instance.oauth_servers.push(Arc::new(server));
        }
        cross_register_trust(&instance.oauth_servers);

        // HTTP-transport mock tool servers (stdio mocks are spawned by the
        // aggregator itself via the generated CRDs).
        for spec in &pre.mcp_servers {
            if !spec.is_mock() || spec.transport == TransportKind::Stdio {
                continue;
            }
            let mock_port = self.broker.reserve(&instance.id)?;
            instance.reserved_ports.push(mock_port);
            let registry = ToolRegistry::new(spec.name.clone(), spec.tools.clone());

            if let Some(gate) = &spec.oauth {
                let oauth = instance
                    .oauth_server(&gate.server)
                    .ok_or_else(|| OAuthError::UnknownServer(gate.server.clone()))?
                    .clone();
                let server = ProtectedMockServer::start(
                    registry,
                    mock_port,
                    spec.transport,
                    oauth,
                    gate.required_scope.clone(),
                )?;
                wait_for_http_ok(
                    &format!(
                        "http://localhost:{mock_port}/.well-known/oauth-protected-resource"
                    ),
                    &spec.name,
                )
                .await?;
                instance.protected_servers.push(server);
            } else {
                let server = MockToolHttpServer::start(registry, mock_port, spec.transport)?;
                wait_for_mcp_ping(&server.url(), &spec.name).await?;
                instance.tool_servers.push(server);
            }
        }

        self.materialize_config(instance, &pre)?;

        // Pre-generate a bearer when the aggregator itself enforces auth,
        // so the readiness probe can see through the login wall.
        if let Some(spec) = pre.oauth_servers.iter().find(|s| s.use_as_muster_oauth)
            && let Some(server) = instance.oauth_server(&spec.name)
        {
            let token = format!("pregen_{}", uuid::Uuid::new_v4().simple());
            let expires_at = server.clock().now()
                + chrono::TimeDelta::from_std(spec.token_lifetime)
                    .unwrap_or(chrono::TimeDelta::MAX);
            server.add_token(
                &token,
                None,
                &spec.scopes.join(" "),
                &spec.client_id,
                expires_at,
            );
            instance.bearer_token = Some(token);
        }

        instance.expected = expected_resources(&pre);

        // Spawn the aggregator in its own process group.
        let mut command = Command::new(&self.settings.muster_binary);
        command
            .arg("serve")
            .arg("--config-path")
            .arg(instance.config_tree.config_dir())
            .arg("--debug");
        let mut child = process::spawn_in_new_process_group(command)?;
        instance.log_capture = Some(LogCapture::start(child.stdout.take(), child.stderr.take()));
        instance.process = Some(child);

        readiness::wait_for_port(instance.port).await?;
        readiness::wait_for_resources(
            &instance.endpoint,
            instance.bearer_token.as_deref(),
            &instance.expected,
            self.settings.debug,
        )
        .await?;

        Ok(())
    }

    fn materialize_config(
        &self,
        instance: &ManagedInstance,
        pre: &crate::scenario::schema::PreConfiguration,
    ) -> Result<(), HarnessError> {
        let tree = &instance.config_tree;

        let ca_pems: Vec<String> = instance
            .oauth_servers
            .iter()
            .filter_map(|s| s.ca_cert_pem())
            .collect();
        let ca_bundle = tree.write_ca_bundle(&ca_pems)?;

        let server_idp = pre
            .oauth_servers
            .iter()
            .find(|s| s.use_as_muster_oauth)
            .and_then(|spec| {
                instance.oauth_server(&spec.name).map(|server| ServerIdp {
                    issuer_url: server.issuer().to_string(),
                    client_id: spec.client_id.clone(),
                    client_secret: spec.client_secret.clone(),
                })
            });

        tree.write_main_config(
            instance.port,
            &OAuthBlock {
                server_idp,
                ca_bundle,
            },
            pre.main_config.as_ref(),
        )?;

        for spec in &pre.mcp_servers {
            let endpoint = self.child_endpoint(instance, spec)?;
            tree.write_mcp_server_crd(
                &spec.name,
                spec.transport.crd_type(),
                &endpoint,
                spec.auth.as_ref(),
            )?;
        }

        tree.write_named_crds(CrdKind::Workflow, &pre.workflows)?;
        tree.write_named_crds(CrdKind::ServiceClass, &pre.service_classes)?;
        tree.write_named_crds(CrdKind::Service, &pre.services)?;
        Ok(())
    }

    /// Resolves where the generated CRD should point for one child server.
    fn child_endpoint(
        &self,
        instance: &ManagedInstance,
        spec: &McpServerSpec,
    ) -> Result<ChildEndpoint, HarnessError> {
        if spec.is_mock() {
            if spec.transport == TransportKind::Stdio {
                // The aggregator spawns this very binary as the mock child.
                let sidecar = instance.config_tree.write_mock_sidecar(&MockServerConfig {
                    name: spec.name.clone(),
                    tools: spec.tools.clone(),
                })?;
                let exe = std::env::current_exe().map_err(|e| InstanceError::SpawnFailed {
                    binary: "muster-test".to_string(),
                    message: e.to_string(),
                })?;
                return Ok(ChildEndpoint::Command {
                    command: exe.display().to_string(),
                    args: vec![
                        "mock-server".to_string(),
                        "--config".to_string(),
                        sidecar.display().to_string(),
                    ],
                });
            }
            let url = instance
                .protected_servers
                .iter()
                .find(|s| s.name() == spec.name)
                .map(ProtectedMockServer::url)
                .or_else(|| {
                    instance
                        .tool_servers
                        .iter()
                        .find(|s| s.name() == spec.name)
                        .map(MockToolHttpServer::url)
                })
                .ok_or_else(|| InstanceError::MockNotReady {
                    name: spec.name.clone(),
                    timeout: MOCK_READY_TIMEOUT,
                })?;
            return Ok(ChildEndpoint::Url(url));
        }

        if let Some(url) = &spec.url {
            return Ok(ChildEndpoint::Url(url.clone()));
        }
        if let Some(command) = &spec.command {
            return Ok(ChildEndpoint::Command {
                command: command.clone(),
                args: spec.args.clone(),
            });
        }
        // The loader rejects this shape; defensive path for direct API use.
        Err(InstanceError::ConfigTree {
            path: instance.config_tree.root().to_path_buf(),
            message: format!("child server {} has no endpoint", spec.name),
        }
        .into())
    }

    async fn teardown(&self, mut instance: ManagedInstance) -> LogSnapshot {
        if let Some(mut child) = instance.process.take() {
            process::terminate(&mut child, SHUTDOWN_GRACE).await;
        }

        let logs = match instance.log_capture.take() {
            Some(capture) => capture.close().await,
            None => LogSnapshot::default(),
        };

        // Mocks of the same class stop concurrently; classes stop in
        // reverse setup order.
        join_all(
            instance
                .protected_servers
                .iter()
                .map(|s| s.stop(MOCK_STOP_TIMEOUT)),
        )
        .await;
        join_all(instance.tool_servers.iter().map(|s| s.stop(MOCK_STOP_TIMEOUT))).await;
        join_all(instance.oauth_servers.iter().map(|s| s.stop(MOCK_STOP_TIMEOUT))).await;

        for port in &instance.reserved_ports {
            if let Err(e) = self.broker.release(*port, &instance.id) {
                warn!(port, error = %e, "port release failed");
            }
        }

        if self.settings.keep_temp_config || self.settings.debug {
            info!(
                root = %instance.config_tree.root().display(),
                "config tree retained"
            );
        } else {
            instance.config_tree.remove();
        }

        logs
    }
}

/// Registers every peer's signing key for each server's trusted issuers,
/// so RFC 8693 exchange between co-located mocks needs no JWKS fetch.
fn cross_register_trust(servers: &[Arc<MockOAuthServer>]) {
    for server in servers {
        // Trusted-issuer table lives in the server's config; re-derive the
        // connector → issuer pairs via the discovery helpers.
        for peer in servers {
            let (_, n, e) = peer.jwk_components();
            for (connector, issuer_url) in server.trusted_issuer_pairs() {
                if issuer_url == peer.issuer() {
                    server.add_trusted_issuer_key(&connector, peer.issuer(), &n, &e);
                }
            }
        }
    }
}

/// Computes the readiness expectations from the pre-configuration.
///
/// OAuth-protected children contribute no expected tools: the aggregator
/// hides their tools until a session authenticates.
fn expected_resources(pre: &crate::scenario::schema::PreConfiguration) -> ExpectedResources {
    let mut expected = ExpectedResources::default();
    for server in &pre.mcp_servers {
        if server.oauth.is_some() {
            continue;
        }
        for tool in &server.tools {
            expected.tools.push(format!("x_{}_{}", server.name, tool.name));
        }
    }
    expected.service_classes = names_of(&pre.service_classes);
    expected.services = names_of(&pre.services);
    expected.workflows = names_of(&pre.workflows);
    expected
}

fn names_of(items: &[serde_json::Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| {
            item.get("name")
                .or_else(|| item.get("metadata").and_then(|m| m.get("name")))
                .and_then(|n| n.as_str())
                .map(str::to_string)
        })
        .collect()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Polls a mock OAuth server's discovery document until it answers.
async fn wait_for_oauth_discovery(server: &MockOAuthServer) -> Result<(), InstanceError> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(2));
    if let Some(ca) = server.ca_cert_pem()
        && let Ok(cert) = reqwest::Certificate::from_pem(ca.as_bytes())
    {
        builder = builder.add_root_certificate(cert);
    }
    let client = builder.build().map_err(|e| InstanceError::OAuthNotReady {
        name: format!("{} ({e})", server.name()),
        timeout: MOCK_READY_TIMEOUT,
    })?;

    let url = format!("{}/.well-known/openid-configuration", server.issuer());
    let deadline = tokio::time::Instant::now() + MOCK_READY_TIMEOUT;
    loop {
        if let Ok(resp) = client.get(&url).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(InstanceError::OAuthNotReady {
                name: server.name().to_string(),
                timeout: MOCK_READY_TIMEOUT,
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls a plain mock tool server with an MCP ping until it answers.
async fn wait_for_mcp_ping(url: &str, name: &str) -> Result<(), InstanceError> {
    let client = reqwest::Client::new();
    let ping = serde_json::json!({"jsonrpc": "2.0", "method": "ping", "id": 0});
    let deadline = tokio::time::Instant::now() + MOCK_READY_TIMEOUT;
    loop {
        if let Ok(resp) = client.post(url).json(&ping).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(InstanceError::MockNotReady {
                name: name.to_string(),
                timeout: MOCK_READY_TIMEOUT,
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls an unauthenticated URL until it returns 200.
async fn wait_for_http_ok(url: &str, name: &str) -> Result<(), InstanceError> {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + MOCK_READY_TIMEOUT;
    loop {
        if let Ok(resp) = client.get(url).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(InstanceError::MockNotReady {
                name: name.to_string(),
                timeout: MOCK_READY_TIMEOUT,
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_flattens_to_dns_safe() {
        assert_eq!(sanitize("OAuth Flow #4"), "oauth-flow--4");
        assert_eq!(sanitize("smoke"), "smoke");
    }

    #[test]
    fn expected_resources_skip_protected_servers() {
        let pre: crate::scenario::schema::PreConfiguration = serde_yaml::from_str(
            r#"
mcp_servers:
  - name: echo
    tools:
      - name: echo_text
        responses: [{response: hi}]
  - name: secured
    tools:
      - name: ping
        responses: [{response: pong}]
    oauth:
      server: idp
oauth_servers:
  - name: idp
workflows:
  - name: deploy
services:
  - name: db
service_classes:
  - name: postgres
"#,
        )
        .unwrap();
        let expected = expected_resources(&pre);
        assert_eq!(expected.tools, vec!["x_echo_echo_text"]);
        assert_eq!(expected.workflows, vec!["deploy"]);
        assert_eq!(expected.services, vec!["db"]);
        assert_eq!(expected.service_classes, vec!["postgres"]);
    }

    #[test]
    fn names_of_reads_metadata_names_too() {
        let items = vec![
            json!({"name": "a"}),
            json!({"metadata": {"name": "b"}}),
            json!({"unnamed": true}),
        ];
        assert_eq!(names_of(&items), vec!["a", "b"]);
    }

    #[test]
    fn default_settings_resolve_binary() {
        let settings = HarnessSettings::default();
        assert_eq!(settings.base_port, 18000);
        assert!(!settings.muster_binary.is_empty());
    }
}
