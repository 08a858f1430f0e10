//! `run` command: load, filter, execute, report.

use std::sync::Arc;

use tracing::info;

use crate::cli::args::{OutputFormat, RunArgs};
use crate::error::{ExitCode, HarnessError};
use crate::instance::{HarnessSettings, InstanceManager};
use crate::report::cli::CliReporter;
use crate::report::json::JsonReporter;
use crate::report::{Reporter, write_report_file};
use crate::runner::{RunnerConfig, SuiteRunner};
use crate::scenario::{ScenarioFilter, filter_scenarios, load_scenarios};

/// Executes the suite, returning the process exit code.
///
/// # Errors
///
/// Returns [`HarnessError`] for load/validation failures; scenario
/// failures are reflected in the exit code, not as errors.
pub async fn execute(args: RunArgs, verbose: bool) -> Result<i32, HarnessError> {
    let scenarios = load_scenarios(&args.path)?;
    let filter = ScenarioFilter {
        category: args.category,
        concept: args.concept,
        name: args.scenario.clone(),
        tag: args.tag.clone(),
    };
    let scenarios = filter_scenarios(scenarios, &filter)?;
    info!(count = scenarios.len(), path = %args.path.display(), "scenarios selected");

    let manager = Arc::new(InstanceManager::new(HarnessSettings {
        base_port: args.base_port,
        muster_binary: args.muster_binary.clone(),
        keep_temp_config: args.keep_temp_config,
        debug: args.debug,
    }));

    let reporters: Vec<Arc<dyn Reporter>> = match args.format {
        OutputFormat::Human => vec![Arc::new(CliReporter::new(verbose, args.parallel > 1))],
        OutputFormat::Json => vec![Arc::new(JsonReporter::new())],
    };

    let runner = SuiteRunner::new(
        manager,
        RunnerConfig {
            parallel: args.parallel,
            fail_fast: args.fail_fast,
        },
    );
    let suite = runner.run(scenarios, &reporters).await;

    if let Some(dir) = &args.report_path {
        let path = write_report_file(dir, &suite)?;
        info!(path = %path.display(), "report written");
    }

    Ok(if suite.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURES
    })
}
