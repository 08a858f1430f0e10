//! Scenario loading, validation, and filtering.
//!
//! `load_scenarios` accepts a single YAML file or a directory, which is
//! walked recursively for `*.yaml` / `*.yml`. A file may contain one
//! scenario mapping or a sequence of scenarios. Validation is strict:
//! structural problems abort the suite before any instance is created.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, Severity, ValidationIssue};
use crate::scenario::schema::{Category, Concept, Scenario};

/// Filters applied after loading.
#[derive(Debug, Clone, Default)]
pub struct ScenarioFilter {
    /// Keep only scenarios of this category.
    pub category: Option<Category>,
    /// Keep only scenarios of this concept.
    pub concept: Option<Concept>,
    /// Keep only the scenario with this exact name.
    pub name: Option<String>,
    /// Keep only scenarios carrying this tag.
    pub tag: Option<String>,
}

impl ScenarioFilter {
    fn matches(&self, scenario: &Scenario) -> bool {
        self.category.is_none_or(|c| scenario.category == c)
            && self.concept.is_none_or(|c| scenario.concept == c)
            && self.name.as_ref().is_none_or(|n| &scenario.name == n)
            && self
                .tag
                .as_ref()
                .is_none_or(|t| scenario.tags.iter().any(|tag| tag == t))
    }
}

/// Loads all scenarios under `path` (file or directory), sorted by name.
///
/// # Errors
///
/// Returns [`ConfigError`] for a missing path, parse failures, validation
/// failures, or duplicate scenario names.
pub fn load_scenarios(path: &Path) -> Result<Vec<Scenario>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingPath {
            path: path.to_path_buf(),
        });
    }

    let files = if path.is_dir() {
        collect_yaml_files(path)?
    } else {
        vec![path.to_path_buf()]
    };

    let mut scenarios = Vec::new();
    let mut seen = HashSet::new();
    for file in files {
        for scenario in load_file(&file)? {
            if !seen.insert(scenario.name.clone()) {
                return Err(ConfigError::DuplicateScenario {
                    name: scenario.name,
                });
            }
            scenarios.push(scenario);
        }
    }

    scenarios.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(count = scenarios.len(), "scenarios loaded");
    Ok(scenarios)
}

/// Applies `filter`, erroring when nothing remains.
///
/// # Errors
///
/// Returns [`ConfigError::NoScenarios`] when the filter removes everything.
pub fn filter_scenarios(
    scenarios: Vec<Scenario>,
    filter: &ScenarioFilter,
) -> Result<Vec<Scenario>, ConfigError> {
    let kept: Vec<Scenario> = scenarios
        .into_iter()
        .filter(|s| filter.matches(s))
        .collect();
    if kept.is_empty() {
        return Err(ConfigError::NoScenarios);
    }
    Ok(kept)
}

/// Validates a single scenario, returning all issues found.
#[must_use]
pub fn validate_scenario(scenario: &Scenario) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let error = |path: &str, message: &str| ValidationIssue {
        path: path.to_string(),
        message: message.to_string(),
        severity: Severity::Error,
    };

    if scenario.name.trim().is_empty() {
        issues.push(error("name", "scenario name is empty"));
    }
    if scenario.steps.is_empty() {
        issues.push(error("steps", "scenario has no steps"));
    }

    let mut step_ids = HashSet::new();
    for (list, prefix) in [(&scenario.steps, "steps"), (&scenario.cleanup, "cleanup")] {
        for (index, step) in list.iter().enumerate() {
            let at = format!("{prefix}[{index}]");
            if step.id.trim().is_empty() {
                issues.push(error(&format!("{at}.id"), "step id is empty"));
            } else if !step_ids.insert(step.id.clone()) {
                issues.push(error(
                    &format!("{at}.id"),
                    &format!("duplicate step id: {}", step.id),
                ));
            }
            if step.tool.trim().is_empty() {
                issues.push(error(&format!("{at}.tool"), "step tool is empty"));
            }
            if let Some(wait) = step.expected.wait_for_state
                && wait.is_zero()
            {
                issues.push(error(
                    &format!("{at}.expected.wait_for_state"),
                    "wait_for_state must be positive",
                ));
            }
            if let Some(retry) = &step.retry
                && retry.count > 20
            {
                issues.push(ValidationIssue {
                    path: format!("{at}.retry.count"),
                    message: format!("retry count {} is suspiciously high", retry.count),
                    severity: Severity::Warning,
                });
            }
        }
    }

    if let Some(pre) = &scenario.pre_configuration {
        let mut oauth_names = HashSet::new();
        for (index, server) in pre.oauth_servers.iter().enumerate() {
            if !oauth_names.insert(server.name.clone()) {
                issues.push(error(
                    &format!("pre_configuration.oauth_servers[{index}].name"),
                    &format!("duplicate oauth server name: {}", server.name),
                ));
            }
        }
        for (index, server) in pre.mcp_servers.iter().enumerate() {
            let at = format!("pre_configuration.mcp_servers[{index}]");
            if let Some(gate) = &server.oauth
                && !oauth_names.contains(&gate.server)
            {
                issues.push(error(
                    &format!("{at}.oauth.server"),
                    &format!("references undeclared oauth server: {}", gate.server),
                ));
            }
            if !server.is_mock() && server.url.is_none() && server.command.is_none() {
                issues.push(error(
                    &at,
                    "server declares no mock tools, url, or command",
                ));
            }
        }
    }

    issues
}

fn load_file(path: &Path) -> Result<Vec<Scenario>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    // A file holds either one scenario mapping or a sequence of them.
    let value: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let scenarios: Vec<Scenario> = match value {
        serde_yaml::Value::Sequence(_) => {
            serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
        other => vec![serde_yaml::from_value(other).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?],
    };

    for scenario in &scenarios {
        let issues = validate_scenario(scenario);
        let errors: Vec<ValidationIssue> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .cloned()
            .collect();
        if !errors.is_empty() {
            return Err(ConfigError::Validation {
                path: format!("{} ({})", path.display(), scenario.name),
                issues: errors,
            });
        }
        for warning in issues {
            tracing::warn!(scenario = %scenario.name, "{warning}");
        }
    }

    Ok(scenarios)
}

fn collect_yaml_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| ConfigError::Parse {
            path: current.clone(),
            message: e.to_string(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ConfigError::Parse {
                path: current.clone(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml")
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_scenario(dir: &Path, file: &str, body: &str) {
        let mut f = std::fs::File::create(dir.join(file)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    const VALID: &str = r#"
name: smoke
category: behavioral
concept: workflow
steps:
  - id: list
    tool: core_workflow_list
"#;

    #[test]
    fn loads_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "smoke.yaml", VALID);
        let scenarios = load_scenarios(&dir.path().join("smoke.yaml")).unwrap();
        assert_eq!(scenarios.len(), 1);
    }

    #[test]
    fn walks_directories_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write_scenario(dir.path(), "a.yaml", VALID);
        write_scenario(
            &dir.path().join("nested"),
            "b.yml",
            &VALID.replace("smoke", "smoke-two"),
        );
        let scenarios = load_scenarios(dir.path()).unwrap();
        assert_eq!(scenarios.len(), 2);
        // Sorted by name
        assert_eq!(scenarios[0].name, "smoke");
        assert_eq!(scenarios[1].name, "smoke-two");
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = load_scenarios(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPath { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "a.yaml", VALID);
        write_scenario(dir.path(), "b.yaml", VALID);
        let err = load_scenarios(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateScenario { .. }));
    }

    #[test]
    fn empty_steps_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(
            dir.path(),
            "bad.yaml",
            "name: bad\ncategory: behavioral\nconcept: workflow\nsteps: []\n",
        );
        let err = load_scenarios(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn duplicate_step_ids_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(
            dir.path(),
            "dup.yaml",
            r#"
name: dup
category: behavioral
concept: workflow
steps:
  - id: s
    tool: a
  - id: s
    tool: b
"#,
        );
        let err = load_scenarios(dir.path()).unwrap_err();
        let ConfigError::Validation { issues, .. } = err else {
            panic!("expected validation error");
        };
        assert!(issues.iter().any(|i| i.message.contains("duplicate step id")));
    }

    #[test]
    fn undeclared_oauth_reference_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(
            dir.path(),
            "ref.yaml",
            r#"
name: ref
category: integration
concept: child-server
pre_configuration:
  mcp_servers:
    - name: secured
      tools:
        - name: ping
          responses:
            - response: pong
      oauth:
        server: idp
steps:
  - id: s
    tool: x_secured_ping
"#,
        );
        let err = load_scenarios(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "a.yaml", VALID);
        write_scenario(
            dir.path(),
            "b.yaml",
            &VALID
                .replace("smoke", "integ")
                .replace("behavioral", "integration"),
        );
        let scenarios = load_scenarios(dir.path()).unwrap();

        let filter = ScenarioFilter {
            category: Some(Category::Integration),
            ..Default::default()
        };
        let kept = filter_scenarios(scenarios.clone(), &filter).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "integ");

        let filter = ScenarioFilter {
            name: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            filter_scenarios(scenarios, &filter),
            Err(ConfigError::NoScenarios)
        ));
    }

    #[test]
    fn sequence_files_hold_multiple_scenarios() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(
            dir.path(),
            "multi.yaml",
            r#"
- name: one
  category: behavioral
  concept: service
  steps:
    - id: s
      tool: core_service_get
- name: two
  category: behavioral
  concept: service
  steps:
    - id: s
      tool: core_service_get
"#,
        );
        let scenarios = load_scenarios(dir.path()).unwrap();
        assert_eq!(scenarios.len(), 2);
    }
}
