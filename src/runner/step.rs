//! Step evaluation: template resolution, helper dispatch, result storage,
//! expectation matching with optional wait-for-state polling, and retry.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::McpTestClient;
use crate::instance::ManagedInstance;
use crate::report::{StepResult, StepStatus};
use crate::runner::context::{ScenarioContext, TemplateResolver};
use crate::runner::expect::{self, StepOutcome};
use crate::runner::helpers;
use crate::scenario::schema::Step;

/// Interval between wait-for-state polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline applied to a single attempt when the step declares none.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes one step against the scenario's client and mocks.
pub async fn execute_step(
    step: &Step,
    instance: &ManagedInstance,
    client: &McpTestClient,
    context: &ScenarioContext,
    resolver: &TemplateResolver,
) -> StepResult {
    let started_at = Utc::now();
    let started = Instant::now();

    let retries_allowed = step.retry.as_ref().map_or(0, |r| r.count);
    let retry_delay = step
        .retry
        .as_ref()
        .map_or(Duration::from_secs(1), |r| r.delay);

    let mut retries = 0;
    let (outcome, mismatches) = loop {
        let (outcome, mismatches) = run_with_polling(step, instance, client, context, resolver).await;
        if mismatches.is_empty() || retries >= retries_allowed {
            break (outcome, mismatches);
        }
        retries += 1;
        debug!(step = %step.id, retries, "retrying step");
        tokio::time::sleep(retry_delay).await;
    };

    // Store the result even when expectations failed: later steps and the
    // report may still want the captured value.
    if let Some(name) = &step.store
        && let Some(result) = &outcome.result
    {
        context.store_result(name, result.storable_value());
    }

    let status = if mismatches.is_empty() {
        StepStatus::Passed
    } else if outcome.transport_error.is_some() {
        StepStatus::Error
    } else {
        StepStatus::Failed
    };

    if status != StepStatus::Passed {
        warn!(step = %step.id, ?status, ?mismatches, "step did not pass");
    }

    StepResult {
        step_id: step.id.clone(),
        tool: step.tool.clone(),
        status,
        started_at,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        response_text: outcome.result.as_ref().map(|r| r.joined_text()),
        error: match (&outcome.transport_error, &outcome.result) {
            (Some(transport), _) => Some(transport.clone()),
            (None, Some(result)) if result.is_error => Some(result.joined_text()),
            _ => None,
        },
        mismatches,
        retries,
    }
}

/// Runs the attempt loop: a single attempt, or a 1 s polling loop when
/// `wait_for_state` is set. Each poll re-resolves templates so stored
/// results from earlier polls are visible.
async fn run_with_polling(
    step: &Step,
    instance: &ManagedInstance,
    client: &McpTestClient,
    context: &ScenarioContext,
    resolver: &TemplateResolver,
) -> (StepOutcome, Vec<String>) {
    let Some(wait) = step.expected.wait_for_state else {
        let outcome = attempt(step, instance, client, context, resolver).await;
        let mismatches = expect::evaluate(&step.expected, &outcome);
        return (outcome, mismatches);
    };

    let deadline = Instant::now() + wait;
    loop {
        let outcome = attempt(step, instance, client, context, resolver).await;
        let mismatches = expect::evaluate(&step.expected, &outcome);
        if mismatches.is_empty() {
            return (outcome, mismatches);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            let mut mismatches = mismatches;
            mismatches.push(format!("state not reached within {}", humantime::format_duration(wait)));
            return (outcome, mismatches);
        }
        debug!(step = %step.id, "wait_for_state poll did not match yet");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// One tool invocation with templates resolved against the current
/// context snapshot.
async fn attempt(
    step: &Step,
    instance: &ManagedInstance,
    client: &McpTestClient,
    context: &ScenarioContext,
    resolver: &TemplateResolver,
) -> StepOutcome {
    let snapshot = context.get_all_stored_results();
    let args = Value::Object(resolver.resolve_args(&step.args, &snapshot));
    let budget = step.timeout.unwrap_or(DEFAULT_ATTEMPT_TIMEOUT);

    let call = async {
        if helpers::is_helper_tool(&step.tool) {
            match helpers::invoke_helper(&step.tool, &args, instance, client).await {
                Ok(outcome) => outcome,
                Err(e) => StepOutcome::from_transport_error(e.to_string()),
            }
        } else {
            match client.call_tool(&step.tool, &args).await {
                Ok(result) => StepOutcome::from_result(result),
                Err(e) => StepOutcome::from_transport_error(e.to_string()),
            }
        }
    };

    match tokio::time::timeout(budget, call).await {
        Ok(outcome) => outcome,
        Err(_) => StepOutcome::from_transport_error(format!(
            "step timed out after {}",
            humantime::format_duration(budget)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::result::ToolResult;

    // Step execution against a live aggregator is covered by the
    // integration suite; here we pin the status classification rules.

    #[test]
    fn status_classification() {
        // Mirrors the mapping in execute_step.
        let classify = |outcome: &StepOutcome, mismatches: &[String]| {
            if mismatches.is_empty() {
                StepStatus::Passed
            } else if outcome.transport_error.is_some() {
                StepStatus::Error
            } else {
                StepStatus::Failed
            }
        };

        let ok = StepOutcome::from_result(ToolResult::text("ok"));
        assert_eq!(classify(&ok, &[]), StepStatus::Passed);

        let failed = StepOutcome::from_result(ToolResult::error("no"));
        assert_eq!(
            classify(&failed, &["mismatch".to_string()]),
            StepStatus::Failed
        );

        let errored = StepOutcome::from_transport_error("refused");
        assert_eq!(
            classify(&errored, &["mismatch".to_string()]),
            StepStatus::Error
        );

        // A transport error the expectations accept is a pass.
        assert_eq!(classify(&errored, &[]), StepStatus::Passed);
    }
}
