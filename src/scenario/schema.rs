//! Typed scenario schema.
//!
//! YAML is parsed once into these structs at load time; downstream code
//! never touches raw YAML. Free-form blocks destined for the aggregator's
//! own config tree (workflows, service classes, services, main-config
//! overrides) intentionally stay `serde_json::Value` and are written out
//! verbatim.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mock::tools::ToolSpec;

/// Serde adapters for humantime duration strings (`"30s"`, `"1h"`).
pub mod duration {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Adapter for `Option<Duration>` fields.
    pub mod option {
        use super::{Deserialize, Deserializer, Duration, Serializer};

        /// Deserializes an optional humantime string.
        ///
        /// # Errors
        ///
        /// Returns a deserialization error for unparseable durations.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let text: Option<String> = Option::deserialize(deserializer)?;
            text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
                .transpose()
        }

        /// Serializes an optional duration back to humantime form.
        ///
        /// # Errors
        ///
        /// Propagates serializer errors.
        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }
    }
}

/// Scenario category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Exercises externally observable behavior of a single concern.
    Behavioral,
    /// Exercises cross-component integration paths.
    Integration,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Behavioral => write!(f, "behavioral"),
            Self::Integration => write!(f, "integration"),
        }
    }
}

/// The aggregator concept a scenario targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Concept {
    /// Service class lifecycle and availability.
    Serviceclass,
    /// Workflow definition and execution.
    Workflow,
    /// Child tool server aggregation.
    ChildServer,
    /// Service instance lifecycle.
    Service,
}

impl std::fmt::Display for Concept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serviceclass => write!(f, "serviceclass"),
            Self::Workflow => write!(f, "workflow"),
            Self::ChildServer => write!(f, "child-server"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// A loaded scenario. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Unique scenario name.
    pub name: String,
    /// Category (behavioral or integration).
    pub category: Category,
    /// Concept tag.
    pub concept: Concept,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Free-form tags for filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When `true` the scenario is reported as skipped without running.
    #[serde(default)]
    pub skip: bool,
    /// Whole-scenario deadline.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Collaborators to stand up before the aggregator starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_configuration: Option<PreConfiguration>,
    /// Ordered steps; at least one.
    pub steps: Vec<Step>,
    /// Cleanup steps; always run, even after a failure.
    #[serde(default)]
    pub cleanup: Vec<Step>,
}

/// One step of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Step id, unique within the scenario.
    pub id: String,
    /// Tool to invoke (aggregator tool or `test_*` helper).
    pub tool: String,
    /// Tool arguments; string values may contain `{{ .var }}` templates.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Expected outcome.
    #[serde(default)]
    pub expected: Expectation,
    /// Retry policy for transient failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-step deadline.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Variable name under which to store this step's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    /// User-session selector for multi-session scenarios.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_user: Option<String>,
}

/// Retry policy for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub count: u32,
    /// Delay between attempts.
    #[serde(default = "default_retry_delay", with = "retry_delay")]
    pub delay: Duration,
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

mod retry_delay {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

/// Expected outcome of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    /// Whether the call must succeed.
    #[serde(default = "default_true")]
    pub success: bool,
    /// Substrings required in the response text (case-insensitive).
    #[serde(default)]
    pub contains: Vec<String>,
    /// Substrings forbidden in the response text (case-insensitive).
    #[serde(default)]
    pub not_contains: Vec<String>,
    /// Substrings required in the error text (case-insensitive).
    #[serde(default)]
    pub error_contains: Vec<String>,
    /// Top-level response-JSON keys compared by deep equality.
    #[serde(default)]
    pub json_path: Map<String, Value>,
    /// Expected HTTP status code, for helper calls that surface one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Turns matching into a polling loop with this deadline.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub wait_for_state: Option<Duration>,
}

const fn default_true() -> bool {
    true
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            success: true,
            contains: Vec::new(),
            not_contains: Vec::new(),
            error_contains: Vec::new(),
            json_path: Map::new(),
            status_code: None,
            wait_for_state: None,
        }
    }
}

/// Collaborators and config the aggregator must see before steps run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreConfiguration {
    /// Child tool servers (mock or external).
    #[serde(default)]
    pub mcp_servers: Vec<McpServerSpec>,
    /// Mock OAuth identity providers.
    #[serde(default)]
    pub oauth_servers: Vec<OAuthServerSpec>,
    /// Workflow definitions, written verbatim as CRDs.
    #[serde(default)]
    pub workflows: Vec<Value>,
    /// Service class definitions, written verbatim as CRDs.
    #[serde(default)]
    pub service_classes: Vec<Value>,
    /// Service definitions, written verbatim as CRDs.
    #[serde(default)]
    pub services: Vec<Value>,
    /// Merged into the generated `config.yaml` last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_config: Option<Value>,
}

/// Transport a child tool server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Spawned child process, NDJSON over stdin/stdout.
    #[default]
    Stdio,
    /// HTTP with server-sent events.
    Sse,
    /// Streamable HTTP.
    StreamableHttp,
}

impl TransportKind {
    /// The `spec.type` value written into the MCPServer CRD.
    #[must_use]
    pub const fn crd_type(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

/// A declared child tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpServerSpec {
    /// Server name; tools surface as `x_<name>_<tool>`.
    pub name: String,
    /// Transport the server speaks.
    #[serde(rename = "type", default)]
    pub transport: TransportKind,
    /// Embedded mock tool definitions. Present ⇒ the harness provides the
    /// server (stdio: this binary in `mock-server` mode; http: in-process).
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// External URL for a real (non-mock) HTTP server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// External command for a real (non-mock) stdio server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// OAuth gating: wraps the HTTP mock in the protected variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthGate>,
    /// `spec.auth` block mirrored into the CRD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
}

impl McpServerSpec {
    /// Whether the harness itself provides this server as a mock.
    #[must_use]
    pub fn is_mock(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// OAuth gating of a mock tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthGate {
    /// Name of the mock OAuth server tokens are validated against.
    pub server: String,
    /// Scope the bearer token must carry.
    #[serde(default = "default_required_scope")]
    pub required_scope: String,
}

fn default_required_scope() -> String {
    "openid".to_string()
}

/// CRD `spec.auth` sub-block for token forwarding and exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AuthSpec {
    /// Forward the caller's token to the child server.
    #[serde(default)]
    pub forward_token: bool,
    /// RFC 8693 token-exchange configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_exchange: Option<TokenExchangeSpec>,
    /// Fall back to the aggregator's own auth when forwarding fails.
    #[serde(default)]
    pub fallback_to_own_auth: bool,
}

/// Token-exchange block of the CRD `spec.auth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TokenExchangeSpec {
    /// Whether exchange is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Connector id presented as the RFC 8693 audience.
    pub connector_id: String,
    /// Scopes requested on the exchanged token.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Token endpoint of the exchanging IdP; defaults to the mock flagged
    /// as the aggregator's own OAuth server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dex_token_endpoint: Option<String>,
    /// Issuer expected on the exchanged token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_issuer: Option<String>,
}

/// A declared mock OAuth identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthServerSpec {
    /// Server name, referenced by protected mocks and helper steps.
    pub name: String,
    /// Issuer hint; the effective issuer is the bound URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Scopes the server accepts.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Enforce PKCE on the authorization-code flow.
    #[serde(default)]
    pub require_pkce: bool,
    /// Skip the consent page and redirect immediately.
    #[serde(default = "default_true")]
    pub auto_approve: bool,
    /// Access/id token lifetime.
    #[serde(default = "default_token_lifetime", with = "retry_delay")]
    pub token_lifetime: Duration,
    /// OAuth client id the aggregator uses.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// OAuth client secret.
    #[serde(default = "default_client_secret")]
    pub client_secret: String,
    /// When set, `/token` always fails with this OAuth error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate_error: Option<String>,
    /// Wire a mockable clock that `test_advance_oauth_clock` can shift.
    #[serde(default)]
    pub use_mock_clock: bool,
    /// Designate this mock as the aggregator's own upstream IdP.
    #[serde(default)]
    pub use_as_muster_oauth: bool,
    /// Trusted issuers for RFC 8693 exchange: connector id → issuer URL.
    #[serde(default)]
    pub trusted_issuers: std::collections::BTreeMap<String, String>,
    /// Serve over TLS with an in-memory self-signed certificate.
    #[serde(default)]
    pub tls: bool,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_token_lifetime() -> Duration {
    Duration::from_secs(3600)
}

fn default_client_id() -> String {
    "muster-test-client".to_string()
}

fn default_client_secret() -> String {
    "muster-test-secret".to_string()
}
