//! Per-scenario driver: create instance → wait-for-ready → run steps →
//! cleanup → destroy, with the scenario deadline applied to the step
//! phase and cleanup running unconditionally.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, info_span, warn};
use tracing::Instrument as _;

use crate::client::McpTestClient;
use crate::error::TransportError;
use crate::instance::{InstanceManager, ManagedInstance};
use crate::report::{ScenarioResult, ScenarioStatus, StepResult, StepStatus};
use crate::runner::context::{ScenarioContext, TemplateResolver};
use crate::runner::step::execute_step;
use crate::scenario::schema::{Scenario, Step};

/// Deadline applied when a scenario declares none.
const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-user MCP sessions within one scenario.
///
/// The default session carries the instance's pre-generated bearer (if
/// any); `as_user` steps get their own lazily-connected session with a
/// distinct session id.
struct SessionPool {
    endpoint: String,
    bearer: Option<String>,
    debug: bool,
    default: McpTestClient,
    users: HashMap<String, McpTestClient>,
}

impl SessionPool {
    async fn connect(
        endpoint: &str,
        bearer: Option<&str>,
        debug: bool,
    ) -> Result<Self, TransportError> {
        let mut default = McpTestClient::new(debug);
        match bearer {
            Some(token) => default.connect_with_auth(endpoint, token).await?,
            None => default.connect(endpoint).await?,
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            bearer: bearer.map(str::to_string),
            debug,
            default,
            users: HashMap::new(),
        })
    }

    async fn client_for(&mut self, as_user: Option<&str>) -> Result<&McpTestClient, TransportError> {
        let Some(user) = as_user else {
            return Ok(&self.default);
        };
        if !self.users.contains_key(user) {
            let mut client = McpTestClient::new(self.debug);
            match self.bearer.as_deref() {
                Some(token) => client.connect_with_auth(&self.endpoint, token).await?,
                None => client.connect(&self.endpoint).await?,
            }
            self.users.insert(user.to_string(), client);
        }
        Ok(&self.users[user])
    }
}

/// Runs one scenario to completion.
pub async fn run_scenario(manager: &InstanceManager, scenario: &Scenario) -> ScenarioResult {
    let span = info_span!("scenario", name = %scenario.name);
    run_scenario_inner(manager, scenario).instrument(span).await
}

async fn run_scenario_inner(manager: &InstanceManager, scenario: &Scenario) -> ScenarioResult {
    if scenario.skip {
        info!("scenario skipped");
        return ScenarioResult::skipped(scenario);
    }

    let started = std::time::Instant::now();
    let instance = match manager.create(scenario).await {
        Ok(instance) => instance,
        Err(failure) => {
            return ScenarioResult {
                name: scenario.name.clone(),
                category: scenario.category,
                concept: scenario.concept,
                status: ScenarioStatus::Error,
                steps: Vec::new(),
                error: Some(failure.error.to_string()),
                logs: failure.logs.map(|l| l.combined()),
                duration_ms: elapsed_ms(started),
            };
        }
    };

    let context = ScenarioContext::new();
    let resolver = TemplateResolver::new();
    let step_results: Mutex<Vec<StepResult>> = Mutex::new(Vec::new());

    let mut pool = match SessionPool::connect(
        &instance.endpoint,
        instance.bearer_token.as_deref(),
        manager.settings().debug,
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            let logs = manager.destroy(instance).await;
            return ScenarioResult {
                name: scenario.name.clone(),
                category: scenario.category,
                concept: scenario.concept,
                status: ScenarioStatus::Error,
                steps: Vec::new(),
                error: Some(format!("scenario client connect failed: {e}")),
                logs: Some(logs.combined()),
                duration_ms: elapsed_ms(started),
            };
        }
    };

    // Step phase under the scenario deadline. Collected results live
    // outside the timed future so a timeout keeps what already ran.
    let deadline = scenario.timeout.unwrap_or(DEFAULT_SCENARIO_TIMEOUT);
    let phase = run_steps(
        &scenario.steps,
        &instance,
        &mut pool,
        &context,
        &resolver,
        &step_results,
    );
    let (mut status, mut error) = match tokio::time::timeout(deadline, phase).await {
        Ok(status) => (status, None),
        Err(_) => (
            ScenarioStatus::Error,
            Some(format!(
                "scenario timed out after {}",
                humantime::format_duration(deadline)
            )),
        ),
    };

    // Cleanup always runs; a cleanup failure demotes a pass but never
    // upgrades a failure.
    if !scenario.cleanup.is_empty() {
        let cleanup_ok = run_cleanup(
            &scenario.cleanup,
            &instance,
            &mut pool,
            &context,
            &resolver,
            &step_results,
        )
        .await;
        if !cleanup_ok && status == ScenarioStatus::Passed {
            status = ScenarioStatus::Failed;
            error.get_or_insert_with(|| "cleanup step failed".to_string());
        }
    }

    let logs = manager.destroy(instance).await;
    let steps = step_results
        .into_inner()
        .expect("step results lock poisoned");

    ScenarioResult {
        name: scenario.name.clone(),
        category: scenario.category,
        concept: scenario.concept,
        status,
        steps,
        error,
        logs: (status != ScenarioStatus::Passed).then(|| logs.combined()),
        duration_ms: elapsed_ms(started),
    }
}

/// Runs the main steps in program order, stopping at the first step that
/// does not pass. Remaining steps are recorded as skipped.
async fn run_steps(
    steps: &[Step],
    instance: &ManagedInstance,
    pool: &mut SessionPool,
    context: &ScenarioContext,
    resolver: &TemplateResolver,
    results: &Mutex<Vec<StepResult>>,
) -> ScenarioStatus {
    let mut status = ScenarioStatus::Passed;
    let mut abort_index = steps.len();

    for (index, step) in steps.iter().enumerate() {
        let client = match pool.client_for(step.as_user.as_deref()).await {
            Ok(client) => client,
            Err(e) => {
                results
                    .lock()
                    .expect("step results lock poisoned")
                    .push(session_error_result(step, &e));
                status = ScenarioStatus::Error;
                abort_index = index + 1;
                break;
            }
        };

        let result = execute_step(step, instance, client, context, resolver).await;
        let step_status = result.status;
        results
            .lock()
            .expect("step results lock poisoned")
            .push(result);

        match step_status {
            StepStatus::Passed => {}
            StepStatus::Failed => {
                status = ScenarioStatus::Failed;
                abort_index = index + 1;
                break;
            }
            StepStatus::Error | StepStatus::Skipped => {
                status = ScenarioStatus::Error;
                abort_index = index + 1;
                break;
            }
        }
    }

    // Record unexecuted steps so the report shows the full plan.
    let mut guard = results.lock().expect("step results lock poisoned");
    for step in &steps[abort_index.min(steps.len())..] {
        guard.push(skipped_result(step));
    }
    drop(guard);

    status
}

/// Runs cleanup steps unconditionally; returns whether all passed.
async fn run_cleanup(
    steps: &[Step],
    instance: &ManagedInstance,
    pool: &mut SessionPool,
    context: &ScenarioContext,
    resolver: &TemplateResolver,
    results: &Mutex<Vec<StepResult>>,
) -> bool {
    let mut all_ok = true;
    for step in steps {
        let client = match pool.client_for(step.as_user.as_deref()).await {
            Ok(client) => client,
            Err(e) => {
                warn!(step = %step.id, error = %e, "cleanup session unavailable");
                results
                    .lock()
                    .expect("step results lock poisoned")
                    .push(session_error_result(step, &e));
                all_ok = false;
                continue;
            }
        };
        let result = execute_step(step, instance, client, context, resolver).await;
        if result.status != StepStatus::Passed {
            warn!(step = %step.id, status = ?result.status, "cleanup step did not pass");
            all_ok = false;
        }
        results
            .lock()
            .expect("step results lock poisoned")
            .push(result);
    }
    all_ok
}

fn skipped_result(step: &Step) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        tool: step.tool.clone(),
        status: StepStatus::Skipped,
        started_at: chrono::Utc::now(),
        duration_ms: 0,
        response_text: None,
        error: None,
        mismatches: Vec::new(),
        retries: 0,
    }
}

fn session_error_result(step: &Step, error: &TransportError) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        tool: step.tool.clone(),
        status: StepStatus::Error,
        started_at: chrono::Utc::now(),
        duration_ms: 0,
        response_text: None,
        error: Some(error.to_string()),
        mismatches: vec![format!("session connect failed: {error}")],
        retries: 0,
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
