//! `validate` command: strict scenario validation without execution.

use serde_json::json;

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::error::{ExitCode, HarnessError, Severity};
use crate::scenario::{load_scenarios, validate_scenario};

/// Validates scenario files, returning the process exit code.
///
/// # Errors
///
/// Returns [`HarnessError`] only for I/O-level problems; validation
/// findings are reported via output and exit code.
pub async fn execute(args: ValidateArgs, _verbose: bool) -> Result<i32, HarnessError> {
    let mut failures = 0usize;
    let mut findings = Vec::new();

    for path in &args.paths {
        match load_scenarios(path) {
            Ok(scenarios) => {
                for scenario in &scenarios {
                    for issue in validate_scenario(scenario) {
                        let is_error =
                            issue.severity == Severity::Error || args.strict;
                        if is_error {
                            failures += 1;
                        }
                        findings.push(json!({
                            "path": path.display().to_string(),
                            "scenario": scenario.name,
                            "issue": issue.to_string(),
                            "fatal": is_error,
                        }));
                    }
                }
            }
            Err(e) => {
                failures += 1;
                findings.push(json!({
                    "path": path.display().to_string(),
                    "issue": e.to_string(),
                    "fatal": true,
                }));
            }
        }
    }

    match args.format {
        OutputFormat::Human => {
            for finding in &findings {
                println!(
                    "{}: {}",
                    finding["path"].as_str().unwrap_or_default(),
                    finding["issue"].as_str().unwrap_or_default()
                );
            }
            if failures == 0 {
                println!("all scenario files valid");
            } else {
                println!("{failures} validation failure(s)");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "failures": failures,
                    "findings": findings,
                }))?
            );
        }
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::CONFIG_ERROR
    })
}
