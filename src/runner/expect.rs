//! Expectation matching against step outcomes.
//!
//! A step outcome is either a transport error or an inner tool result
//! (possibly errored). Matching returns the full list of mismatches so
//! reports show everything that diverged, not just the first check.

use crate::client::result::ToolResult;
use crate::matching::values_match;
use crate::scenario::schema::Expectation;

/// What a tool or helper invocation produced, as seen by the matcher.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Transport-level error text, when the call never produced a result.
    pub transport_error: Option<String>,
    /// The inner tool result, when one was produced.
    pub result: Option<ToolResult>,
    /// HTTP status code, for helper calls that surface one.
    pub status_code: Option<u16>,
}

impl StepOutcome {
    /// Wraps a successful tool result.
    #[must_use]
    pub fn from_result(result: ToolResult) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    /// Wraps a transport error.
    #[must_use]
    pub fn from_transport_error(message: impl Into<String>) -> Self {
        Self {
            transport_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Whether the call failed (transport error or errored inner result).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.transport_error.is_some() || self.result.as_ref().is_some_and(|r| r.is_error)
    }

    /// Joined text of the inner result.
    #[must_use]
    pub fn response_text(&self) -> String {
        self.result
            .as_ref()
            .map(ToolResult::joined_text)
            .unwrap_or_default()
    }

    /// Transport error text concatenated with errored-result text.
    #[must_use]
    pub fn error_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(transport) = &self.transport_error {
            parts.push(transport.clone());
        }
        if let Some(result) = &self.result
            && result.is_error
        {
            parts.push(result.joined_text());
        }
        parts.join("\n")
    }
}

/// Evaluates `expectation` against `outcome`.
///
/// Returns the list of human-readable mismatches; empty means the
/// expectation is met. `wait_for_state` is not interpreted here — the
/// step evaluator owns the polling loop and calls this per cycle.
#[must_use]
pub fn evaluate(expectation: &Expectation, outcome: &StepOutcome) -> Vec<String> {
    let mut mismatches = Vec::new();

    if expectation.success && outcome.is_failure() {
        mismatches.push(format!(
            "expected success but call failed: {}",
            truncate(&outcome.error_text(), 200)
        ));
    }
    if !expectation.success && !outcome.is_failure() {
        mismatches.push("expected failure but call succeeded".to_string());
    }

    let response = outcome.response_text().to_lowercase();
    for needle in &expectation.contains {
        if !response.contains(&needle.to_lowercase()) {
            mismatches.push(format!(
                "response does not contain {needle:?}: {}",
                truncate(&outcome.response_text(), 200)
            ));
        }
    }
    for needle in &expectation.not_contains {
        if response.contains(&needle.to_lowercase()) {
            mismatches.push(format!("response must not contain {needle:?} but does"));
        }
    }

    let error_text = outcome.error_text().to_lowercase();
    for needle in &expectation.error_contains {
        if !error_text.contains(&needle.to_lowercase()) {
            mismatches.push(format!(
                "error text does not contain {needle:?}: {}",
                truncate(&outcome.error_text(), 200)
            ));
        }
    }

    if !expectation.json_path.is_empty() {
        match outcome.result.as_ref().and_then(ToolResult::first_text_json) {
            Some(decoded) => {
                for (key, expected) in &expectation.json_path {
                    match decoded.get(key) {
                        Some(actual) if values_match(expected, actual) => {}
                        Some(actual) => mismatches.push(format!(
                            "json_path {key}: expected {expected}, got {actual}"
                        )),
                        None => mismatches.push(format!("json_path {key}: key absent")),
                    }
                }
            }
            None => mismatches.push("json_path set but response is not JSON".to_string()),
        }
    }

    if let Some(expected_status) = expectation.status_code {
        match outcome.status_code {
            Some(actual) if actual == expected_status => {}
            Some(actual) => {
                mismatches.push(format!("status code: expected {expected_status}, got {actual}"));
            }
            None => mismatches.push(format!(
                "status code: expected {expected_status}, none observed"
            )),
        }
    }

    mismatches
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}
