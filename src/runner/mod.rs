//! Suite runner: worker pool, fail-fast collection, result aggregation.

pub mod context;
pub mod driver;
pub mod expect;
pub mod helpers;
pub mod step;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::instance::InstanceManager;
use crate::report::{Reporter, ScenarioResult, ScenarioStatus, SuiteResult};
use crate::scenario::schema::Scenario;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker count; `<= 1` runs sequentially.
    pub parallel: usize,
    /// Stop reporting after the first failure and wind the pool down.
    pub fail_fast: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            fail_fast: false,
        }
    }
}

/// Drives a set of scenarios through per-scenario aggregator instances.
pub struct SuiteRunner {
    manager: Arc<InstanceManager>,
    config: RunnerConfig,
}

impl SuiteRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>, config: RunnerConfig) -> Self {
        Self { manager, config }
    }

    /// Runs all scenarios and aggregates the suite result.
    ///
    /// Every scenario result is forwarded to the reporters as it arrives,
    /// except results drained after a fail-fast trigger, which are
    /// collected into the suite but not reported.
    pub async fn run(
        &self,
        scenarios: Vec<Scenario>,
        reporters: &[Arc<dyn Reporter>],
    ) -> SuiteResult {
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let total = scenarios.len();

        for reporter in reporters {
            reporter.on_suite_start(total);
        }

        let results = if self.config.parallel <= 1 {
            self.run_sequential(scenarios, reporters).await
        } else {
            self.run_parallel(scenarios, reporters).await
        };

        let suite = SuiteResult::aggregate(
            started_at,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            self.config.parallel.max(1),
            results,
        );
        for reporter in reporters {
            reporter.on_suite_end(&suite);
        }
        suite
    }

    async fn run_sequential(
        &self,
        scenarios: Vec<Scenario>,
        reporters: &[Arc<dyn Reporter>],
    ) -> Vec<ScenarioResult> {
        let mut results = Vec::with_capacity(scenarios.len());
        let mut remaining = scenarios.into_iter();

        for scenario in remaining.by_ref() {
            for reporter in reporters {
                reporter.on_scenario_start(&scenario);
            }
            let result = self.run_one(scenario).await;
            for reporter in reporters {
                reporter.on_scenario_result(&result);
            }
            let failed = matches!(result.status, ScenarioStatus::Failed | ScenarioStatus::Error);
            results.push(result);
            if failed && self.config.fail_fast {
                warn!("fail-fast: stopping after first failure");
                break;
            }
        }

        // Anything not run is recorded as skipped.
        results.extend(remaining.map(|s| ScenarioResult::skipped(&s)));
        results
    }

    async fn run_parallel(
        &self,
        scenarios: Vec<Scenario>,
        reporters: &[Arc<dyn Reporter>],
    ) -> Vec<ScenarioResult> {
        let total = scenarios.len();
        let workers = self.config.parallel.min(total);
        let queue = Arc::new(Mutex::new(scenarios.into_iter().collect::<VecDeque<_>>()));
        // Sized to scenario count so workers never block on a stopped
        // consumer after fail-fast.
        let (result_tx, mut result_rx) = mpsc::channel::<ScenarioResult>(total.max(1));
        let cancel = CancellationToken::new();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let manager = Arc::clone(&self.manager);
            let reporters: Vec<Arc<dyn Reporter>> = reporters.to_vec();
            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let scenario = {
                        let mut guard = queue.lock().expect("scenario queue poisoned");
                        guard.pop_front()
                    };
                    let Some(scenario) = scenario else { break };
                    for reporter in &reporters {
                        reporter.on_scenario_start(&scenario);
                    }
                    let result = run_isolated(&manager, scenario).await;
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        let mut reporting = true;
        while let Some(result) = result_rx.recv().await {
            let failed = matches!(result.status, ScenarioStatus::Failed | ScenarioStatus::Error);
            if reporting {
                for reporter in reporters {
                    reporter.on_scenario_result(&result);
                }
            }
            results.push(result);
            if failed && self.config.fail_fast && reporting {
                warn!("fail-fast: draining remaining workers unreported");
                reporting = false;
                cancel.cancel();
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }

        // Scenarios never picked up after fail-fast are skipped.
        let leftover: Vec<Scenario> = queue
            .lock()
            .expect("scenario queue poisoned")
            .drain(..)
            .collect();
        results.extend(leftover.iter().map(ScenarioResult::skipped));
        results
    }

    async fn run_one(&self, scenario: Scenario) -> ScenarioResult {
        run_isolated(&self.manager, scenario).await
    }
}

/// Runs one scenario in its own task so a panic anywhere in the driver
/// becomes a scenario `Error` instead of taking the runner down.
async fn run_isolated(manager: &Arc<InstanceManager>, scenario: Scenario) -> ScenarioResult {
    let manager = Arc::clone(manager);
    let fallback = ScenarioResult {
        name: scenario.name.clone(),
        category: scenario.category,
        concept: scenario.concept,
        status: ScenarioStatus::Error,
        steps: Vec::new(),
        error: None,
        logs: None,
        duration_ms: 0,
    };

    let handle =
        tokio::spawn(async move { driver::run_scenario(&manager, &scenario).await });
    match handle.await {
        Ok(result) => result,
        Err(join_error) => {
            error!(error = %join_error, "scenario worker panicked");
            ScenarioResult {
                error: Some(format!("scenario panicked: {join_error}")),
                ..fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sequential() {
        let config = RunnerConfig::default();
        assert_eq!(config.parallel, 1);
        assert!(!config.fail_fast);
    }
}
