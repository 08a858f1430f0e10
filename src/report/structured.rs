//! In-memory reporter for programmatic retrieval.
//!
//! Used when the harness runs embedded (e.g. exposed over MCP) and the
//! results are read back by the host instead of printed.

use std::sync::Mutex;

use crate::report::{Reporter, ScenarioResult, SuiteResult};
use crate::scenario::schema::Scenario;

/// Captures results for later retrieval.
#[derive(Default)]
pub struct StructuredReporter {
    results: Mutex<Vec<ScenarioResult>>,
    suite: Mutex<Option<SuiteResult>>,
}

impl StructuredReporter {
    /// Creates the reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scenario results collected so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn results(&self) -> Vec<ScenarioResult> {
        self.results.lock().expect("results lock poisoned").clone()
    }

    /// The final suite, once the run completed.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn suite(&self) -> Option<SuiteResult> {
        self.suite.lock().expect("suite lock poisoned").clone()
    }
}

impl Reporter for StructuredReporter {
    fn on_suite_start(&self, _total: usize) {}

    fn on_scenario_start(&self, _scenario: &Scenario) {}

    fn on_scenario_result(&self, result: &ScenarioResult) {
        self.results
            .lock()
            .expect("results lock poisoned")
            .push(result.clone());
    }

    fn on_suite_end(&self, suite: &SuiteResult) {
        *self.suite.lock().expect("suite lock poisoned") = Some(suite.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{ScenarioStatus, StatusCounts};
    use crate::scenario::schema::{Category, Concept};
    use chrono::Utc;

    #[test]
    fn captures_results_and_suite() {
        let reporter = StructuredReporter::new();
        let result = ScenarioResult {
            name: "x".to_string(),
            category: Category::Behavioral,
            concept: Concept::Service,
            status: ScenarioStatus::Passed,
            steps: Vec::new(),
            error: None,
            logs: None,
            duration_ms: 1,
        };
        reporter.on_scenario_result(&result);
        assert_eq!(reporter.results().len(), 1);
        assert!(reporter.suite().is_none());

        let suite = SuiteResult {
            started_at: Utc::now(),
            duration_ms: 1,
            parallel: 1,
            counts: StatusCounts::default(),
            scenarios: vec![result],
        };
        reporter.on_suite_end(&suite);
        assert_eq!(reporter.suite().unwrap().scenarios.len(), 1);
    }
}
