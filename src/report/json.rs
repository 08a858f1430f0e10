//! JSON reporter: silent while running, emits the suite at the end.

use std::io::Write;
use std::sync::Mutex;

use crate::report::{Reporter, ScenarioResult, SuiteResult};
use crate::scenario::schema::Scenario;

/// Reporter that prints the full suite as JSON on completion.
#[derive(Default)]
pub struct JsonReporter {
    // Collected for completeness; the suite handed to on_suite_end is
    // authoritative.
    seen: Mutex<usize>,
}

impl JsonReporter {
    /// Creates the reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for JsonReporter {
    fn on_suite_start(&self, _total: usize) {}

    fn on_scenario_start(&self, _scenario: &Scenario) {}

    fn on_scenario_result(&self, _result: &ScenarioResult) {
        *self.seen.lock().expect("seen lock poisoned") += 1;
    }

    fn on_suite_end(&self, suite: &SuiteResult) {
        match serde_json::to_string_pretty(suite) {
            Ok(body) => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{body}");
            }
            Err(e) => tracing::error!(error = %e, "suite serialization failed"),
        }
    }
}
