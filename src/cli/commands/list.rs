//! `list` command: show scenarios matching the filters.

use serde_json::json;

use crate::cli::args::{ListArgs, OutputFormat};
use crate::error::{ExitCode, HarnessError};
use crate::scenario::{ScenarioFilter, filter_scenarios, load_scenarios};

/// Lists scenarios, returning the process exit code.
///
/// # Errors
///
/// Returns [`HarnessError`] for load failures.
pub async fn execute(args: ListArgs, _verbose: bool) -> Result<i32, HarnessError> {
    let scenarios = load_scenarios(&args.path)?;
    let filter = ScenarioFilter {
        category: args.category,
        concept: args.concept,
        name: None,
        tag: args.tag.clone(),
    };
    let scenarios = filter_scenarios(scenarios, &filter)?;

    match args.format {
        OutputFormat::Human => {
            for scenario in &scenarios {
                let skip = if scenario.skip { " [skip]" } else { "" };
                println!(
                    "{:<40} {:<12} {:<14} {}{skip}",
                    scenario.name, scenario.category, scenario.concept, scenario.description
                );
            }
            println!("\n{} scenario(s)", scenarios.len());
        }
        OutputFormat::Json => {
            let entries: Vec<_> = scenarios
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "category": s.category,
                        "concept": s.concept,
                        "description": s.description,
                        "tags": s.tags,
                        "skip": s.skip,
                        "steps": s.steps.len(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
