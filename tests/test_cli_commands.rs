//! CLI end-to-end tests for the non-instance subcommands.

use std::io::Write;
use std::path::Path;
use std::process::Command;

const VALID_SCENARIO: &str = r#"
name: smoke
category: behavioral
concept: workflow
description: listing workflows succeeds
tags: [smoke]
steps:
  - id: list
    tool: core_workflow_list
    expected:
      success: true
      contains: ["workflows"]
"#;

const BROKEN_SCENARIO: &str = r#"
name: broken
category: behavioral
concept: workflow
steps: []
"#;

fn write_file(dir: &Path, name: &str, body: &str) {
    let mut file = std::fs::File::create(dir.join(name)).unwrap();
    file.write_all(body.as_bytes()).unwrap();
}

fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_muster-test"))
        .args(args)
        .output()
        .expect("binary runs")
}

#[test]
fn validate_accepts_a_well_formed_scenario() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "smoke.yaml", VALID_SCENARIO);
    let output = run_cli(&["validate", dir.path().join("smoke.yaml").to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("valid"));
}

#[test]
fn validate_rejects_an_empty_step_list() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "broken.yaml", BROKEN_SCENARIO);
    let output = run_cli(&["validate", dir.path().join("broken.yaml").to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn list_prints_matching_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "smoke.yaml", VALID_SCENARIO);
    let output = run_cli(&["list", dir.path().to_str().unwrap(), "--tag", "smoke"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("smoke"));
    assert!(stdout.contains("behavioral"));
}

#[test]
fn list_json_is_machine_readable() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "smoke.yaml", VALID_SCENARIO);
    let output = run_cli(&["list", dir.path().to_str().unwrap(), "--format", "json"]);
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("json output parses");
    assert_eq!(parsed[0]["name"], "smoke");
    assert_eq!(parsed[0]["steps"], 1);
}

#[test]
fn run_against_a_missing_path_is_a_config_error() {
    let output = run_cli(&["run", "/definitely/not/a/scenario/dir"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn filters_that_match_nothing_are_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "smoke.yaml", VALID_SCENARIO);
    let output = run_cli(&[
        "run",
        dir.path().to_str().unwrap(),
        "--scenario",
        "does-not-exist",
    ]);
    assert_eq!(output.status.code(), Some(2));
}
