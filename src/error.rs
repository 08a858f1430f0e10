//! Error types for the muster test harness.
//!
//! Errors are grouped per subsystem (configuration, ports, instance
//! lifecycle, OAuth mocks, transport, helpers) and roll up into
//! [`HarnessError`], which maps every variant to a process exit code.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

// ============================================================================
// Exit Codes
// ============================================================================

/// Process exit codes for the `muster-test` binary.
pub struct ExitCode;

impl ExitCode {
    /// Suite passed.
    pub const SUCCESS: i32 = 0;
    /// One or more scenarios failed or errored.
    pub const FAILURES: i32 = 1;
    /// Scenario load or validation failure.
    pub const CONFIG_ERROR: i32 = 2;
    /// Client could not reach an aggregator.
    pub const TRANSPORT_ERROR: i32 = 3;
    /// Instance setup (ports, process, readiness, mocks) failed.
    pub const SETUP_ERROR: i32 = 4;
    /// Underlying I/O failure.
    pub const IO_ERROR: i32 = 5;
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// A single validation issue found while checking a scenario file.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the problematic field (e.g. `steps[2].expected`).
    pub path: String,
    /// Description of the issue.
    pub message: String,
    /// Severity of the issue.
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Prevents the scenario from running.
    Error,
    /// Suspicious but runnable.
    Warning,
}

/// Scenario loading and validation errors. These abort the suite.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed.
    #[error("parse error in {path}: {message}")]
    Parse {
        /// Path to the scenario file.
        path: PathBuf,
        /// Error message from the parser.
        message: String,
    },

    /// Scenario validation failed.
    #[error("validation failed for {path}")]
    Validation {
        /// Path to the scenario file.
        path: String,
        /// Issues found.
        issues: Vec<ValidationIssue>,
    },

    /// Scenario path does not exist.
    #[error("scenario path not found: {path}")]
    MissingPath {
        /// The missing path.
        path: PathBuf,
    },

    /// No scenarios matched the given filters.
    #[error("no scenarios matched the active filters")]
    NoScenarios,

    /// Duplicate scenario name across the loaded set.
    #[error("duplicate scenario name: {name}")]
    DuplicateScenario {
        /// The conflicting name.
        name: String,
    },
}

// ============================================================================
// Port Broker Errors
// ============================================================================

/// Port reservation errors.
#[derive(Debug, Error)]
pub enum PortError {
    /// The broker exhausted its candidate window.
    #[error("no free port found in {candidates} candidates starting at {base}")]
    Exhausted {
        /// First port probed.
        base: u16,
        /// Number of candidates scanned.
        candidates: u16,
    },

    /// Release was attempted by a non-owner.
    #[error("port {port} is not reserved by instance {instance_id}")]
    NotOwner {
        /// The contested port.
        port: u16,
        /// The caller's instance id.
        instance_id: String,
    },
}

// ============================================================================
// Instance Errors
// ============================================================================

/// Managed-instance lifecycle errors. These turn the scenario into `Error`.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The aggregator process could not be spawned.
    #[error("failed to spawn aggregator {binary}: {message}")]
    SpawnFailed {
        /// Binary that was invoked.
        binary: String,
        /// Underlying error text.
        message: String,
    },

    /// The aggregator port never accepted a TCP connection.
    #[error("aggregator port {port} not ready after {timeout:?}")]
    PortNotReady {
        /// The probed port.
        port: u16,
        /// How long the probe ran.
        timeout: Duration,
    },

    /// Declared resources never became observable.
    #[error("resources not ready after {timeout:?}: missing {missing:?}")]
    ResourcesNotReady {
        /// How long the probe ran.
        timeout: Duration,
        /// Diagnostic list of missing resources.
        missing: Vec<String>,
    },

    /// A mock OAuth server failed its own readiness probe.
    #[error("mock OAuth server {name} not ready after {timeout:?}")]
    OAuthNotReady {
        /// Declared server name.
        name: String,
        /// How long the probe ran.
        timeout: Duration,
    },

    /// A mock tool server failed its readiness probe.
    #[error("mock tool server {name} not ready after {timeout:?}")]
    MockNotReady {
        /// Declared server name.
        name: String,
        /// How long the probe ran.
        timeout: Duration,
    },

    /// Config tree materialization failed.
    #[error("failed to write config tree at {path}: {message}")]
    ConfigTree {
        /// Config tree root.
        path: PathBuf,
        /// Underlying error text.
        message: String,
    },
}

// ============================================================================
// OAuth Mock Errors
// ============================================================================

/// Mock OAuth server setup and runtime errors.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Server could not bind or start.
    #[error("mock OAuth server failed to start: {0}")]
    StartFailed(String),

    /// RSA key or certificate generation failed.
    #[error("key material generation failed: {0}")]
    KeyGeneration(String),

    /// JWT signing or verification failed.
    #[error("token operation failed: {0}")]
    Token(String),

    /// A test helper referenced an unknown OAuth server.
    #[error("unknown mock OAuth server: {0}")]
    UnknownServer(String),

    /// Clock advancement requested but no mock clock is wired.
    #[error("no mock OAuth server has a mock clock")]
    NoMockClock,
}

// ============================================================================
// Transport Errors
// ============================================================================

/// MCP test client transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A method other than connect was called while disconnected.
    #[error("client is not connected")]
    NotConnected,

    /// The initialize handshake failed.
    #[error("connect to {endpoint} failed: {message}")]
    ConnectFailed {
        /// Target endpoint.
        endpoint: String,
        /// Underlying error text.
        message: String,
    },

    /// An HTTP request to the aggregator failed.
    #[error("request failed: {0}")]
    Request(String),

    /// The aggregator returned a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The meta-tool envelope could not be decoded.
    #[error("meta-tool response malformed: {0}")]
    MetaTool(String),

    /// The call exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

// ============================================================================
// Helper Errors
// ============================================================================

/// Test-helper tool errors.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Helper arguments were missing or malformed.
    #[error("invalid helper arguments: {0}")]
    InvalidArgs(String),

    /// The simulated browser leg failed.
    #[error("oauth callback simulation failed: {0}")]
    CallbackFailed(String),
}

// ============================================================================
// Umbrella
// ============================================================================

/// Top-level harness error.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Scenario load or validation failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Port reservation failure.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Instance lifecycle failure.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Mock OAuth failure.
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// Client transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Test helper failure.
    #[error(transparent)]
    Helper(#[from] HelperError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HarnessError {
    /// Maps the error to the process exit code for the `muster-test` binary.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Yaml(_) => ExitCode::CONFIG_ERROR,
            Self::Transport(_) => ExitCode::TRANSPORT_ERROR,
            Self::Port(_) | Self::Instance(_) | Self::OAuth(_) | Self::Helper(_) => {
                ExitCode::SETUP_ERROR
            }
            Self::Io(_) | Self::Json(_) => ExitCode::IO_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_issue_display() {
        let issue = ValidationIssue {
            path: "steps[0].id".to_string(),
            message: "missing id".to_string(),
            severity: Severity::Error,
        };
        assert_eq!(issue.to_string(), "error: missing id at steps[0].id");
    }

    #[test]
    fn exit_code_mapping() {
        let cases: Vec<(HarnessError, i32)> = vec![
            (
                ConfigError::MissingPath {
                    path: PathBuf::from("/x"),
                }
                .into(),
                ExitCode::CONFIG_ERROR,
            ),
            (
                PortError::Exhausted {
                    base: 18000,
                    candidates: 100,
                }
                .into(),
                ExitCode::SETUP_ERROR,
            ),
            (TransportError::NotConnected.into(), ExitCode::TRANSPORT_ERROR),
            (OAuthError::NoMockClock.into(), ExitCode::SETUP_ERROR),
            (
                std::io::Error::new(std::io::ErrorKind::NotFound, "x").into(),
                ExitCode::IO_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.exit_code(), expected, "wrong exit code for {err}");
        }
    }

    #[test]
    fn instance_error_display_names_missing_resources() {
        let err = InstanceError::ResourcesNotReady {
            timeout: Duration::from_secs(15),
            missing: vec!["tool x_echo_echo_text".to_string()],
        };
        assert!(err.to_string().contains("x_echo_echo_text"));
    }
}
