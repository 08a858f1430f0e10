//! CLI argument definitions.
//!
//! All clap derive structs for `muster-test` command-line parsing.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::scenario::schema::{Category, Concept};

// ============================================================================
// Root CLI
// ============================================================================

/// Behavioral and integration test harness for the muster aggregator.
#[derive(Parser, Debug)]
#[command(name = "muster-test", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-error output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, default_value = "human", global = true, env = "MUSTER_TEST_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run test scenarios against per-scenario aggregator instances.
    Run(RunArgs),

    /// Validate scenario files without running them.
    Validate(ValidateArgs),

    /// List scenarios matching the given filters.
    List(ListArgs),

    /// Run as a stdio mock tool server (spawned by the aggregator).
    MockServer(MockServerArgs),
}

// ============================================================================
// Run
// ============================================================================

/// Arguments for `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scenario file or directory.
    #[arg(default_value = "scenarios")]
    pub path: PathBuf,

    /// Only run scenarios of this category.
    #[arg(long)]
    pub category: Option<Category>,

    /// Only run scenarios of this concept.
    #[arg(long)]
    pub concept: Option<Concept>,

    /// Only run the scenario with this name.
    #[arg(long)]
    pub scenario: Option<String>,

    /// Only run scenarios carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Parallel worker count.
    #[arg(long, default_value_t = 1, env = "MUSTER_TEST_PARALLEL")]
    pub parallel: usize,

    /// Stop reporting after the first failure.
    #[arg(long)]
    pub fail_fast: bool,

    /// Base of the port pool instances reserve from.
    #[arg(long, default_value_t = 18000, env = "MUSTER_TEST_BASE_PORT")]
    pub base_port: u16,

    /// Directory to write a JSON report into.
    #[arg(long)]
    pub report_path: Option<PathBuf>,

    /// Retain per-instance config trees after teardown.
    #[arg(long)]
    pub keep_temp_config: bool,

    /// Aggregator binary to spawn.
    #[arg(long, default_value = "muster", env = "MUSTER_TEST_BINARY")]
    pub muster_binary: String,

    /// Extra diagnostics; also retains config trees.
    #[arg(long)]
    pub debug: bool,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// Validate / List
// ============================================================================

/// Arguments for `validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Scenario files or directories to validate.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Treat warnings as errors.
    #[arg(long)]
    pub strict: bool,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

/// Arguments for `list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Scenario file or directory.
    #[arg(default_value = "scenarios")]
    pub path: PathBuf,

    /// Only list scenarios of this category.
    #[arg(long)]
    pub category: Option<Category>,

    /// Only list scenarios of this concept.
    #[arg(long)]
    pub concept: Option<Concept>,

    /// Only list scenarios carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// Mock Server
// ============================================================================

/// Arguments for `mock-server`.
#[derive(Args, Debug)]
pub struct MockServerArgs {
    /// Path to the mock tool definitions YAML.
    #[arg(long)]
    pub config: PathBuf,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable with optional ANSI colors.
    #[default]
    Human,
    /// Newline-delimited JSON.
    Json,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_defaults() {
        let cli = Cli::try_parse_from(["muster-test", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.parallel, 1);
        assert_eq!(args.base_port, 18000);
        assert!(!args.fail_fast);
        assert_eq!(args.path, PathBuf::from("scenarios"));
    }

    #[test]
    fn run_filters_parse() {
        let cli = Cli::try_parse_from([
            "muster-test",
            "run",
            "suite/",
            "--category",
            "integration",
            "--concept",
            "child-server",
            "--scenario",
            "oauth-callback",
            "--parallel",
            "4",
            "--fail-fast",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.category, Some(Category::Integration));
        assert_eq!(args.concept, Some(Concept::ChildServer));
        assert_eq!(args.scenario.as_deref(), Some("oauth-callback"));
        assert_eq!(args.parallel, 4);
        assert!(args.fail_fast);
    }

    #[test]
    fn validate_requires_paths() {
        assert!(Cli::try_parse_from(["muster-test", "validate"]).is_err());
        assert!(Cli::try_parse_from(["muster-test", "validate", "x.yaml"]).is_ok());
    }

    #[test]
    fn mock_server_requires_config() {
        assert!(Cli::try_parse_from(["muster-test", "mock-server"]).is_err());
        let cli =
            Cli::try_parse_from(["muster-test", "mock-server", "--config", "tools.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::MockServer(_)));
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["muster-test", "-vv", "run"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn help_is_displayed() {
        let err = Cli::try_parse_from(["muster-test", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
