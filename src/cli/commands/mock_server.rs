//! `mock-server` command: run this binary as a stdio mock tool server.

use crate::cli::args::MockServerArgs;
use crate::error::{ExitCode, HarnessError};
use crate::mock::stdio::run_stdio_server;

/// Runs the stdio mock loop until EOF, returning the process exit code.
///
/// # Errors
///
/// Returns [`HarnessError`] when the side-car config cannot be loaded or
/// stdout writes fail.
pub async fn execute(args: MockServerArgs) -> Result<i32, HarnessError> {
    run_stdio_server(&args.config).await?;
    Ok(ExitCode::SUCCESS)
}
