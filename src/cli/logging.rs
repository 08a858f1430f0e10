//! Logging initialization.
//!
//! Structured logging via `tracing`, written to stderr so the stdio mock
//! server's stdout stays protocol-clean. `MUSTER_TEST_LOG_LEVEL` takes
//! precedence over the verbosity flags.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::cli::args::LogFormat;

/// Initializes the global tracing subscriber.
///
/// Verbosity mapping (when `MUSTER_TEST_LOG_LEVEL` is not set):
/// - quiet → error
/// - 0 → warn
/// - 1 → info
/// - 2 → debug
/// - 3+ → trace
///
/// Uses `try_init()` so repeated calls (e.g. in tests) are safe.
pub fn init_logging(format: LogFormat, verbosity: u8, quiet: bool) {
    let default_directive = if quiet {
        "error"
    } else {
        match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_env("MUSTER_TEST_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let show_target = verbosity >= 2;

    match format {
        LogFormat::Human => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
