//! Result records and reporters.

pub mod cli;
pub mod json;
pub mod structured;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scenario::schema::{Category, Concept, Scenario};

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Expectations met.
    Passed,
    /// Expectations not met, no transport error.
    Failed,
    /// Transport error the expectations did not accept.
    Error,
    /// Not executed (scenario skipped or aborted earlier).
    Skipped,
}

/// Outcome of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    /// All steps passed and cleanup succeeded.
    Passed,
    /// A step's expectations failed, or cleanup demoted a pass.
    Failed,
    /// Setup, transport, or timeout failure.
    Error,
    /// Scenario was marked `skip`.
    Skipped,
}

/// Result record for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Tool invoked.
    pub tool: String,
    /// Outcome.
    pub status: StepStatus,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Joined response text, when a result was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    /// Error text, when the step errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Expectation mismatches, when the step failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<String>,
    /// Retries consumed.
    pub retries: u32,
}

/// Result record for one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario name.
    pub name: String,
    /// Category.
    pub category: Category,
    /// Concept.
    pub concept: Concept,
    /// Outcome.
    pub status: ScenarioStatus,
    /// Per-step results in execution order.
    pub steps: Vec<StepResult>,
    /// Scenario-level error text (setup failures, timeouts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured aggregator logs (combined stdout/stderr).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ScenarioResult {
    /// Builds a skipped result.
    #[must_use]
    pub fn skipped(scenario: &Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            category: scenario.category,
            concept: scenario.concept,
            status: ScenarioStatus::Skipped,
            steps: Vec::new(),
            error: None,
            logs: None,
            duration_ms: 0,
        }
    }
}

/// Per-status counts of a suite.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Passed scenarios.
    pub passed: usize,
    /// Failed scenarios.
    pub failed: usize,
    /// Errored scenarios.
    pub errored: usize,
    /// Skipped scenarios.
    pub skipped: usize,
}

impl StatusCounts {
    fn record(&mut self, status: ScenarioStatus) {
        match status {
            ScenarioStatus::Passed => self.passed += 1,
            ScenarioStatus::Failed => self.failed += 1,
            ScenarioStatus::Error => self.errored += 1,
            ScenarioStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Result record for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    /// When the suite started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Worker parallelism used.
    pub parallel: usize,
    /// Per-status counts.
    pub counts: StatusCounts,
    /// Per-scenario results.
    pub scenarios: Vec<ScenarioResult>,
}

impl SuiteResult {
    /// Aggregates scenario results.
    #[must_use]
    pub fn aggregate(
        started_at: DateTime<Utc>,
        duration_ms: u64,
        parallel: usize,
        scenarios: Vec<ScenarioResult>,
    ) -> Self {
        let mut counts = StatusCounts::default();
        for scenario in &scenarios {
            counts.record(scenario.status);
        }
        Self {
            started_at,
            duration_ms,
            parallel,
            counts,
            scenarios,
        }
    }

    /// Suite passes only when nothing failed or errored.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.counts.failed == 0 && self.counts.errored == 0
    }
}

/// A reporter consumes scenario results as they arrive.
pub trait Reporter: Send + Sync {
    /// Called once before any scenario runs.
    fn on_suite_start(&self, total: usize);
    /// Called when a scenario begins executing.
    fn on_scenario_start(&self, scenario: &Scenario);
    /// Called with each finished scenario.
    fn on_scenario_result(&self, result: &ScenarioResult);
    /// Called once with the aggregated suite.
    fn on_suite_end(&self, suite: &SuiteResult);
}

/// Writes the JSON report file `test-report-<timestamp>.json` under
/// `dir`, creating the directory if absent. The write is atomic (temp
/// file + rename).
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created or the file
/// cannot be written.
pub fn write_report_file(dir: &Path, suite: &SuiteResult) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("test-report-{timestamp}.json"));
    let tmp = dir.join(format!(".test-report-{timestamp}.json.tmp"));
    let body = serde_json::to_vec_pretty(suite)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}
