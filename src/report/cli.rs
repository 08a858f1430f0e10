//! Textual progress reporter.
//!
//! In sequential mode each scenario prints a start line followed by its
//! verdict. In parallel mode start lines are suppressed and each scenario
//! prints one atomic `name … ✓/✗` line when it finishes, serialized by an
//! internal print lock so interleaved workers never shear output.

use std::io::Write;
use std::sync::Mutex;

use crate::report::{Reporter, ScenarioResult, ScenarioStatus, SuiteResult};
use crate::scenario::schema::Scenario;

/// Longest log excerpt included for a failed scenario.
const LOG_EXCERPT_LIMIT: usize = 4000;

/// CLI reporter writing to stdout.
pub struct CliReporter {
    verbose: bool,
    parallel: bool,
    print_lock: Mutex<()>,
}

impl CliReporter {
    /// Creates a reporter; `parallel` suppresses start lines.
    #[must_use]
    pub fn new(verbose: bool, parallel: bool) -> Self {
        Self {
            verbose,
            parallel,
            print_lock: Mutex::new(()),
        }
    }

    fn print(&self, text: &str) {
        let _guard = self.print_lock.lock().expect("print lock poisoned");
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{text}");
    }
}

impl Reporter for CliReporter {
    fn on_suite_start(&self, total: usize) {
        self.print(&format!("running {total} scenarios"));
    }

    fn on_scenario_start(&self, scenario: &Scenario) {
        if !self.parallel {
            self.print(&format!("  {} …", scenario.name));
        }
    }

    fn on_scenario_result(&self, result: &ScenarioResult) {
        let verdict = match result.status {
            ScenarioStatus::Passed => "✓",
            ScenarioStatus::Failed => "✗ FAILED",
            ScenarioStatus::Error => "✗ ERROR",
            ScenarioStatus::Skipped => "- skipped",
        };
        let mut line = format!(
            "  {} {} ({:.1}s)",
            result.name,
            verdict,
            result.duration_ms as f64 / 1000.0
        );

        if result.status == ScenarioStatus::Failed || result.status == ScenarioStatus::Error {
            if let Some(error) = &result.error {
                line.push_str(&format!("\n    error: {error}"));
            }
            for step in &result.steps {
                for mismatch in &step.mismatches {
                    line.push_str(&format!("\n    [{}] {mismatch}", step.step_id));
                }
            }
            if let Some(logs) = &result.logs {
                line.push_str("\n    --- instance logs ---\n");
                line.push_str(&indent(trim_logs(logs), "    "));
            }
        } else if self.verbose {
            for step in &result.steps {
                line.push_str(&format!(
                    "\n    [{}] {:?} ({} ms)",
                    step.step_id, step.status, step.duration_ms
                ));
            }
        }

        self.print(&line);
    }

    fn on_suite_end(&self, suite: &SuiteResult) {
        self.print(&format!(
            "\n{} passed, {} failed, {} errored, {} skipped in {:.1}s",
            suite.counts.passed,
            suite.counts.failed,
            suite.counts.errored,
            suite.counts.skipped,
            suite.duration_ms as f64 / 1000.0
        ));
    }
}

/// Keeps the tail of long logs; the failure cause is usually last.
fn trim_logs(logs: &str) -> &str {
    if logs.len() <= LOG_EXCERPT_LIMIT {
        return logs;
    }
    let start = logs.len() - LOG_EXCERPT_LIMIT;
    // Cut on a char boundary.
    let mut cut = start;
    while !logs.is_char_boundary(cut) {
        cut += 1;
    }
    &logs[cut..]
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_keeps_the_tail() {
        let logs = "a".repeat(LOG_EXCERPT_LIMIT + 100);
        assert_eq!(trim_logs(&logs).len(), LOG_EXCERPT_LIMIT);
        let short = "short";
        assert_eq!(trim_logs(short), "short");
    }

    #[test]
    fn indent_prefixes_every_line() {
        assert_eq!(indent("a\nb", "  "), "  a\n  b");
    }
}
