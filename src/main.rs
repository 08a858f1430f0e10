//! muster-test entry point.

use clap::Parser;

use muster_test::cli::args::Cli;
use muster_test::cli::{dispatch, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.log_format, cli.verbose, cli.quiet);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            error.exit_code()
        }
    };
    std::process::exit(code);
}
