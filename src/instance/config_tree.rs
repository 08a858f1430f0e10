//! Materializes the per-instance configuration tree the aggregator reads.
//!
//! Layout under the OS temp root:
//!
//! ```text
//! muster-test-<instance>/
//!   muster/
//!     config.yaml
//!     mcpservers/<name>.yaml
//!     workflows/<name>.yaml
//!     serviceclasses/<name>.yaml
//!     services/<name>.yaml
//!   mocks/<name>.yaml        side-car tool definitions for stdio mocks
//!   ca-bundle.pem            CA certs of all TLS-enabled OAuth mocks
//! ```

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::InstanceError;
use crate::mock::tools::MockServerConfig;
use crate::scenario::schema::AuthSpec;

/// CRD apiVersion for all generated resources.
const API_VERSION: &str = "muster.giantswarm.io/v1alpha1";

/// Namespace stamped on generated CRDs.
const NAMESPACE: &str = "default";

/// Kinds of named CRDs written verbatim from pre-configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdKind {
    /// Workflow definitions.
    Workflow,
    /// Service class definitions.
    ServiceClass,
    /// Service instances.
    Service,
}

impl CrdKind {
    const fn kind(self) -> &'static str {
        match self {
            Self::Workflow => "Workflow",
            Self::ServiceClass => "ServiceClass",
            Self::Service => "Service",
        }
    }

    const fn subdir(self) -> &'static str {
        match self {
            Self::Workflow => "workflows",
            Self::ServiceClass => "serviceclasses",
            Self::Service => "services",
        }
    }
}

/// How the generated MCPServer CRD reaches the child server.
#[derive(Debug, Clone)]
pub enum ChildEndpoint {
    /// HTTP child at a URL.
    Url(String),
    /// Stdio child spawned by the aggregator.
    Command {
        /// Executable path.
        command: String,
        /// Arguments.
        args: Vec<String>,
    },
}

/// The aggregator's OAuth configuration, synthesized per instance.
#[derive(Debug, Clone, Default)]
pub struct OAuthBlock {
    /// Upstream IdP when a mock is flagged as the aggregator's own OAuth
    /// server: (issuer URL, client id, client secret, issuer CA PEM path).
    pub server_idp: Option<ServerIdp>,
    /// Path to the CA bundle of all TLS-enabled mocks, if any.
    pub ca_bundle: Option<PathBuf>,
}

/// Upstream IdP parameters for the `oauth.server` block.
#[derive(Debug, Clone)]
pub struct ServerIdp {
    /// Issuer URL of the mock IdP.
    pub issuer_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
}

/// A created per-instance config tree.
#[derive(Debug)]
pub struct ConfigTree {
    root: PathBuf,
    config_dir: PathBuf,
}

impl ConfigTree {
    /// Creates the directory skeleton under the OS temp root.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ConfigTree`] when directories cannot be
    /// created.
    pub fn create(instance_id: &str) -> Result<Self, InstanceError> {
        let root = std::env::temp_dir().join(format!("muster-test-{instance_id}"));
        let config_dir = root.join("muster");
        let tree_err = |e: std::io::Error| InstanceError::ConfigTree {
            path: root.clone(),
            message: e.to_string(),
        };

        for dir in ["mcpservers", "workflows", "serviceclasses", "services"] {
            std::fs::create_dir_all(config_dir.join(dir)).map_err(tree_err)?;
        }
        std::fs::create_dir_all(root.join("mocks")).map_err(tree_err)?;

        debug!(root = %root.display(), "config tree created");
        Ok(Self { root, config_dir })
    }

    /// Tree root (`…/muster-test-<instance>`).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `--config-path` directory handed to the aggregator.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Writes `config.yaml` with the reserved port and OAuth blocks,
    /// merging the scenario's `main_config` override last.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ConfigTree`] on serialization or I/O
    /// failure.
    pub fn write_main_config(
        &self,
        port: u16,
        oauth: &OAuthBlock,
        main_config: Option<&Value>,
    ) -> Result<(), InstanceError> {
        let mut mcp_client = json!({
            "enabled": true,
            "publicUrl": format!("http://localhost:{port}"),
            "callbackPath": "/oauth/callback",
        });
        if let Some(bundle) = &oauth.ca_bundle {
            mcp_client["caFile"] = json!(bundle.display().to_string());
        }

        let mut config = json!({
            "port": port,
            "oauth": {"mcpClient": mcp_client},
        });

        if let Some(idp) = &oauth.server_idp {
            let mut dex = json!({
                "issuerUrl": idp.issuer_url,
                "clientId": idp.client_id,
                "clientSecret": idp.client_secret,
            });
            if let Some(bundle) = &oauth.ca_bundle {
                dex["caFile"] = json!(bundle.display().to_string());
            }
            config["oauth"]["server"] = json!({
                "enabled": true,
                "baseUrl": format!("http://localhost:{port}"),
                "provider": "dex",
                "dex": dex,
                "storage": {"type": "memory"},
                "allowLocalhostRedirectURIs": true,
            });
        }

        if let Some(over) = main_config {
            merge(&mut config, over);
        }

        self.write_yaml(&self.config_dir.join("config.yaml"), &config)
    }

    /// Writes one MCPServer CRD.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ConfigTree`] on serialization or I/O
    /// failure.
    pub fn write_mcp_server_crd(
        &self,
        name: &str,
        crd_type: &str,
        endpoint: &ChildEndpoint,
        auth: Option<&AuthSpec>,
    ) -> Result<(), InstanceError> {
        let mut spec = json!({
            "type": crd_type,
            "autoStart": true,
        });
        match endpoint {
            ChildEndpoint::Url(url) => spec["url"] = json!(url),
            ChildEndpoint::Command { command, args } => {
                spec["command"] = json!(command);
                spec["args"] = json!(args);
            }
        }
        if let Some(auth) = auth {
            spec["auth"] = serde_json::to_value(auth).map_err(|e| InstanceError::ConfigTree {
                path: self.root.clone(),
                message: e.to_string(),
            })?;
        }

        let crd = json!({
            "apiVersion": API_VERSION,
            "kind": "MCPServer",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "spec": spec,
        });
        self.write_yaml(
            &self.config_dir.join("mcpservers").join(format!("{name}.yaml")),
            &crd,
        )
    }

    /// Writes the side-car tool definitions a stdio mock loads, returning
    /// the side-car path.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ConfigTree`] on serialization or I/O
    /// failure.
    pub fn write_mock_sidecar(
        &self,
        config: &MockServerConfig,
    ) -> Result<PathBuf, InstanceError> {
        let path = self.root.join("mocks").join(format!("{}.yaml", config.name));
        let value = serde_json::to_value(config).map_err(|e| InstanceError::ConfigTree {
            path: self.root.clone(),
            message: e.to_string(),
        })?;
        self.write_yaml(&path, &value)?;
        Ok(path)
    }

    /// Writes named CRDs (workflows, service classes, services) from
    /// free-form pre-configuration values.
    ///
    /// Values already shaped as CRDs (carrying `apiVersion`) are written
    /// verbatim; bare definitions are wrapped.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ConfigTree`] on serialization or I/O
    /// failure.
    pub fn write_named_crds(&self, kind: CrdKind, items: &[Value]) -> Result<(), InstanceError> {
        for (index, item) in items.iter().enumerate() {
            let name = item_name(item).unwrap_or_else(|| format!("{}-{index}", kind.subdir()));
            let crd = if item.get("apiVersion").is_some() {
                item.clone()
            } else {
                let mut spec = item.clone();
                if let Some(map) = spec.as_object_mut() {
                    map.remove("name");
                }
                json!({
                    "apiVersion": API_VERSION,
                    "kind": kind.kind(),
                    "metadata": {"name": name, "namespace": NAMESPACE},
                    "spec": spec,
                })
            };
            self.write_yaml(
                &self
                    .config_dir
                    .join(kind.subdir())
                    .join(format!("{name}.yaml")),
                &crd,
            )?;
        }
        Ok(())
    }

    /// Writes the concatenated CA bundle, returning its path. `None` when
    /// there is nothing to bundle.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ConfigTree`] on I/O failure.
    pub fn write_ca_bundle(&self, pems: &[String]) -> Result<Option<PathBuf>, InstanceError> {
        if pems.is_empty() {
            return Ok(None);
        }
        let path = self.root.join("ca-bundle.pem");
        std::fs::write(&path, pems.concat()).map_err(|e| InstanceError::ConfigTree {
            path: self.root.clone(),
            message: e.to_string(),
        })?;
        Ok(Some(path))
    }

    /// Deletes the tree. Failures are logged, not fatal: teardown must
    /// proceed.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), error = %e, "config tree removal failed");
        }
    }

    fn write_yaml(&self, path: &Path, value: &Value) -> Result<(), InstanceError> {
        let text = serde_yaml::to_string(value).map_err(|e| InstanceError::ConfigTree {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|e| InstanceError::ConfigTree {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Deep-merges `over` into `base`; `over` wins on conflicts.
fn merge(base: &mut Value, over: &Value) {
    match (base, over) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            for (key, over_value) in over_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge(base_value, over_value),
                    None => {
                        base_map.insert(key.clone(), over_value.clone());
                    }
                }
            }
        }
        (base_slot, _) => *base_slot = over.clone(),
    }
}

/// Extracts a definition's name: top-level `name` or `metadata.name`.
fn item_name(item: &Value) -> Option<String> {
    item.get("name")
        .or_else(|| item.get("metadata").and_then(|m| m.get("name")))
        .and_then(|n| n.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_yaml(path: &Path) -> Value {
        let text = std::fs::read_to_string(path).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        serde_json::to_value(yaml).unwrap()
    }

    #[test]
    fn creates_expected_layout() {
        let tree = ConfigTree::create("layout-check").unwrap();
        for dir in ["mcpservers", "workflows", "serviceclasses", "services"] {
            assert!(tree.config_dir().join(dir).is_dir());
        }
        assert!(tree.root().join("mocks").is_dir());
        tree.remove();
        assert!(!tree.root().exists());
    }

    #[test]
    fn main_config_carries_port_and_mcp_client() {
        let tree = ConfigTree::create("main-config").unwrap();
        tree.write_main_config(18123, &OAuthBlock::default(), None)
            .unwrap();
        let config = read_yaml(&tree.config_dir().join("config.yaml"));
        assert_eq!(config["port"], 18123);
        assert_eq!(config["oauth"]["mcpClient"]["enabled"], true);
        assert!(config["oauth"].get("server").is_none());
        tree.remove();
    }

    #[test]
    fn oauth_server_block_is_synthesized() {
        let tree = ConfigTree::create("oauth-block").unwrap();
        let bundle = tree
            .write_ca_bundle(&["-----BEGIN CERTIFICATE-----\nx\n-----END CERTIFICATE-----\n"
                .to_string()])
            .unwrap();
        let oauth = OAuthBlock {
            server_idp: Some(ServerIdp {
                issuer_url: "https://localhost:18150".to_string(),
                client_id: "muster-test-client".to_string(),
                client_secret: "muster-test-secret".to_string(),
            }),
            ca_bundle: bundle,
        };
        tree.write_main_config(18151, &oauth, None).unwrap();
        let config = read_yaml(&tree.config_dir().join("config.yaml"));
        assert_eq!(config["oauth"]["server"]["provider"], "dex");
        assert_eq!(config["oauth"]["server"]["storage"]["type"], "memory");
        assert_eq!(
            config["oauth"]["server"]["dex"]["issuerUrl"],
            "https://localhost:18150"
        );
        assert!(
            config["oauth"]["mcpClient"]["caFile"]
                .as_str()
                .unwrap()
                .ends_with("ca-bundle.pem")
        );
        tree.remove();
    }

    #[test]
    fn main_config_override_wins() {
        let tree = ConfigTree::create("override").unwrap();
        let over = json!({"port": 9999, "logging": {"level": "debug"}});
        tree.write_main_config(18100, &OAuthBlock::default(), Some(&over))
            .unwrap();
        let config = read_yaml(&tree.config_dir().join("config.yaml"));
        assert_eq!(config["port"], 9999);
        assert_eq!(config["logging"]["level"], "debug");
        // Non-conflicting generated keys survive.
        assert_eq!(config["oauth"]["mcpClient"]["enabled"], true);
        tree.remove();
    }

    #[test]
    fn mcp_server_crd_shapes() {
        let tree = ConfigTree::create("crds").unwrap();
        tree.write_mcp_server_crd(
            "echo",
            "streamable-http",
            &ChildEndpoint::Url("http://localhost:18170/mcp".to_string()),
            None,
        )
        .unwrap();
        let crd = read_yaml(&tree.config_dir().join("mcpservers/echo.yaml"));
        assert_eq!(crd["kind"], "MCPServer");
        assert_eq!(crd["metadata"]["name"], "echo");
        assert_eq!(crd["spec"]["type"], "streamable-http");
        assert_eq!(crd["spec"]["url"], "http://localhost:18170/mcp");

        let auth: AuthSpec = serde_yaml::from_str(
            "forwardToken: true\ntokenExchange:\n  connectorId: upstream\n  scopes: [openid]\n",
        )
        .unwrap();
        tree.write_mcp_server_crd(
            "worker",
            "stdio",
            &ChildEndpoint::Command {
                command: "/bin/muster-test".to_string(),
                args: vec!["mock-server".to_string()],
            },
            Some(&auth),
        )
        .unwrap();
        let crd = read_yaml(&tree.config_dir().join("mcpservers/worker.yaml"));
        assert_eq!(crd["spec"]["command"], "/bin/muster-test");
        assert_eq!(crd["spec"]["auth"]["forwardToken"], true);
        assert_eq!(crd["spec"]["auth"]["tokenExchange"]["connectorId"], "upstream");
        tree.remove();
    }

    #[test]
    fn named_crds_are_wrapped_unless_already_shaped() {
        let tree = ConfigTree::create("named").unwrap();
        tree.write_named_crds(
            CrdKind::Workflow,
            &[
                json!({"name": "deploy", "steps": [{"tool": "x"}]}),
                json!({"apiVersion": "muster.giantswarm.io/v1alpha1", "kind": "Workflow",
                       "metadata": {"name": "verbatim"}, "spec": {}}),
            ],
        )
        .unwrap();
        let wrapped = read_yaml(&tree.config_dir().join("workflows/deploy.yaml"));
        assert_eq!(wrapped["kind"], "Workflow");
        assert_eq!(wrapped["metadata"]["name"], "deploy");
        assert!(wrapped["spec"].get("name").is_none());
        assert_eq!(wrapped["spec"]["steps"][0]["tool"], "x");
        let verbatim = read_yaml(&tree.config_dir().join("workflows/verbatim.yaml"));
        assert_eq!(verbatim["metadata"]["name"], "verbatim");
        tree.remove();
    }

    #[test]
    fn empty_ca_bundle_writes_nothing() {
        let tree = ConfigTree::create("nobundle").unwrap();
        assert!(tree.write_ca_bundle(&[]).unwrap().is_none());
        assert!(!tree.root().join("ca-bundle.pem").exists());
        tree.remove();
    }
}
