use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn suite(submit: &str, fetch: &str) -> String {
    format!(
        r#"
[automator]
suite_name = "smoke"
poll_interval_secs = 0

[client]
submit_command = "{submit}"
fetch_command = "{fetch}"
report_base_url = "https://reports.example.com"

[report]
output_dir = "reports"
csv_file = "reports/testRunsRaw.csv"

[[devices]]
name = "pixel"
udid = "ABC123"

[[devices.test_cases]]
name = "login"
timeout_mins = 5

[[devices]]
name = "iphone"

[[devices.test_cases]]
name = "login"
specification = "spec-a"
"#
    )
}

const ACCEPT: &str = r#"echo '{\"success\": true, \"message\": \"exec-{test_case}\"}'"#;
const PASS: &str = r#"echo '{\"status\": 0, \"key_string\": \"key-{execution_id}\"}'"#;
const FAIL: &str = r#"echo '{\"status\": 1, \"key_string\": \"key-{execution_id}\"}'"#;

fn write_suite(dir: &Path, content: &str) {
    std::fs::write(dir.join("automator.toml"), content).unwrap();
}

#[test]
fn validate_accepts_a_valid_suite() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(dir.path(), &suite(ACCEPT, PASS));

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Planned runs: 2"));
}

#[test]
fn validate_rejects_a_suite_without_devices() {
    let dir = tempfile::tempdir().unwrap();
    let content = suite(ACCEPT, PASS);
    let without_devices = content
        .split("[[devices]]")
        .next()
        .unwrap()
        .to_string();
    write_suite(dir.path(), &without_devices);

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no devices configured"));
}

#[test]
fn list_prints_planned_runs_as_json() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(dir.path(), &suite(ACCEPT, PASS));

    let output = cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let entries: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["device"], "pixel");
    assert_eq!(entries[0]["udid"], "ABC123");
    assert_eq!(entries[0]["timeout_mins"], 5);
    assert_eq!(entries[1]["specification"], "spec-a");
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created automator.toml"));
    assert!(dir.path().join("automator.toml").exists());

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success();

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn run_writes_reports_and_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(dir.path(), &suite(ACCEPT, PASS));

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .success();

    let junit =
        std::fs::read_to_string(dir.path().join("reports/TEST-com.jamosolutions.smoke.xml"))
            .unwrap();
    assert!(junit.contains(r#"tests="2""#));
    assert!(junit.contains("reportDetail=key-exec-login"));

    let csv = std::fs::read_to_string(dir.path().join("reports/testRunsRaw.csv")).unwrap();
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.lines().skip(1).all(|line| line.contains(";SUCCESS;")));
}

#[test]
fn run_fails_on_negative_results_and_retries_them() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(dir.path(), &suite(ACCEPT, FAIL));

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .args(["run", "--retest", "1", "--csv", "raw.csv"])
        .assert()
        .code(1);

    let csv = std::fs::read_to_string(dir.path().join("raw.csv")).unwrap();
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.iter().filter(|r| r.ends_with(";true")).count(), 2);
    assert!(rows.iter().all(|r| r.contains(";FAILURE;")));
}

#[test]
fn run_records_rejected_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let reject = r#"echo '{\"success\": false, \"message\": \"device offline\"}'"#;
    write_suite(dir.path(), &suite(reject, PASS));

    cargo_bin_cmd!("automator")
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .code(1);

    let junit =
        std::fs::read_to_string(dir.path().join("reports/TEST-com.jamosolutions.smoke.xml"))
            .unwrap();
    assert!(junit.contains(r#"errors="2""#));
    assert!(junit.contains(r#"message="device offline""#));
}
