//! Command-line interface.

pub mod args;
pub mod commands;
pub mod logging;

use crate::error::HarnessError;
use args::{Cli, Commands};

/// Dispatches a parsed CLI invocation, returning the process exit code.
///
/// # Errors
///
/// Returns [`HarnessError`] for failures the commands do not map to exit
/// codes themselves.
pub async fn dispatch(cli: Cli) -> Result<i32, HarnessError> {
    let verbose = cli.verbose > 0;
    match cli.command {
        Commands::Run(args) => commands::run::execute(args, verbose).await,
        Commands::Validate(args) => commands::validate::execute(args, verbose).await,
        Commands::List(args) => commands::list::execute(args, verbose).await,
        Commands::MockServer(args) => commands::mock_server::execute(args).await,
    }
}
