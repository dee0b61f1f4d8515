//! Configuration schema definitions for automator.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML suite files. A suite file describes both how the engine behaves and
//! what it runs: the devices and the test cases to execute on each of them.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── AutomatorConfig        - Engine settings (retries, polling, error thresholds)
//! ├── ClientConfig           - Commands bridging to the remote execution service
//! ├── ReportConfig           - JUnit XML / CSV output settings
//! └── DeviceConfig[]         - Target devices
//!     └── TestCaseConfig[]   - Test cases to run on that device
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::{Device, PlannedTestRun, TestCase};
use crate::orchestrator::{OrchestratorSettings, RetryPolicy};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [automator]
/// suite_name = "smoke"
/// retest_count = 1
///
/// [client]
/// submit_command = "./jamo submit {device} {test_case}"
/// fetch_command = "./jamo report {execution_id}"
///
/// [[devices]]
/// name = "pixel"
///
/// [[devices.test_cases]]
/// name = "login"
/// timeout_mins = 5
/// ```
///
/// # Example
///
/// ```
/// use automator::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [automator]
///     suite_name = "smoke"
///
///     [client]
///     submit_command = "submit {device} {test_case}"
///     fetch_command = "fetch {execution_id}"
///
///     [[devices]]
///     name = "pixel"
///
///     [[devices.test_cases]]
///     name = "login"
/// "#).unwrap();
///
/// assert_eq!(config.planned_runs().len(), 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core engine settings.
    pub automator: AutomatorConfig,

    /// How to reach the remote execution service.
    pub client: ClientConfig,

    /// Report output settings (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,

    /// Devices and the test cases to run on them.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Core engine settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `retest_count` | 0 (never retry) |
/// | `poll_interval_secs` | 5 |
/// | `progress_every_rounds` | 12 |
/// | `suspend_error_threshold` | 3 |
/// | `fatal_error_threshold` | 5 |
/// | `suspend_secs` | 420 (7 minutes) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutomatorConfig {
    /// Suite name, used in report names and JUnit class names.
    pub suite_name: String,

    /// How many times a planned run with a negative outcome is retried.
    ///
    /// Failures, execution errors and timeouts are all retried. Set to 0 to
    /// disable retries.
    #[serde(default)]
    pub retest_count: u32,

    /// Pause between two ticks of the driver loop.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// A progress line is logged every this many rounds.
    #[serde(default = "default_progress_every")]
    pub progress_every_rounds: u32,

    /// Fetch errors on one run after which all polling pauses.
    #[serde(default = "default_suspend_threshold")]
    pub suspend_error_threshold: u32,

    /// Fetch errors on one run after which the whole suite aborts.
    #[serde(default = "default_fatal_threshold")]
    pub fatal_error_threshold: u32,

    /// Length of the polling pause in seconds.
    #[serde(default = "default_suspend_secs")]
    pub suspend_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_progress_every() -> u32 {
    12
}

fn default_suspend_threshold() -> u32 {
    3
}

fn default_fatal_threshold() -> u32 {
    5
}

fn default_suspend_secs() -> u64 {
    7 * 60
}

impl AutomatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Orchestrator settings derived from this section.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retry: RetryPolicy::new(self.retest_count),
            suspend_error_threshold: self.suspend_error_threshold,
            fatal_error_threshold: self.fatal_error_threshold,
            suspend_window: Duration::from_secs(self.suspend_secs),
        }
    }
}

/// Commands bridging to the remote execution service.
///
/// # Placeholders
///
/// - `submit_command`: `{device}`, `{udid}`, `{test_case}`, `{specification}`
/// - `fetch_command`: `{execution_id}`
///
/// Absent optional values are substituted as empty strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Starts an execution and prints `{"success": bool, "message": "..."}`.
    pub submit_command: String,

    /// Polls an execution and prints its result, or nothing while pending.
    pub fetch_command: String,

    /// Working directory for both commands.
    pub working_dir: Option<PathBuf>,

    /// Upper bound for a single command in seconds. Unlimited by default.
    pub timeout_secs: Option<u64>,

    /// Base URL of the human-readable reports.
    #[serde(default = "default_report_base_url")]
    pub report_base_url: String,
}

fn default_report_base_url() -> String {
    "https://jamo-release.appspot.com".to_string()
}

/// Report output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory receiving the JUnit XML file.
    ///
    /// Default: `target/surefire-reports`
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report of the final runs.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Prefix of JUnit class names (`{package}.{suite}.{device}`).
    #[serde(default = "default_junit_package")]
    pub junit_package: String,

    /// Write a CSV row for every attempt, including retried ones.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub csv: bool,

    /// Path of the CSV file.
    ///
    /// Default: `target/testRunsRaw.csv`
    #[serde(default = "default_csv_file")]
    pub csv_file: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("target/surefire-reports")
}

fn default_true() -> bool {
    true
}

fn default_junit_package() -> String {
    "com.jamosolutions".to_string()
}

fn default_csv_file() -> PathBuf {
    PathBuf::from("target/testRunsRaw.csv")
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_package: default_junit_package(),
            csv: true,
            csv_file: default_csv_file(),
        }
    }
}

/// A target device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,

    /// Unique device identifier. When set, the remote service addresses the
    /// device by it instead of by name.
    pub udid: Option<String>,

    #[serde(default)]
    pub test_cases: Vec<TestCaseConfig>,
}

impl DeviceConfig {
    pub fn device(&self) -> Device {
        let device = Device::new(&self.name);
        match &self.udid {
            Some(udid) if !udid.trim().is_empty() => device.with_udid(udid),
            _ => device,
        }
    }
}

/// A test case to run on a device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestCaseConfig {
    pub name: String,

    /// Minutes to wait for a result after submission.
    ///
    /// Default: 15
    #[serde(default = "default_timeout_mins")]
    pub timeout_mins: u64,

    /// Optional execution specification passed to the remote service.
    pub specification: Option<String>,
}

fn default_timeout_mins() -> u64 {
    15
}

impl TestCaseConfig {
    pub fn test_case(&self) -> TestCase {
        let timeout = Duration::from_secs(self.timeout_mins.saturating_mul(60));
        let case = TestCase::new(&self.name).with_timeout(timeout);
        match &self.specification {
            Some(spec) => case.with_specification(spec),
            None => case,
        }
    }
}

impl Config {
    /// One first-attempt planned run per (device, test case), in file order.
    pub fn planned_runs(&self) -> Vec<PlannedTestRun> {
        self.devices
            .iter()
            .flat_map(|d| {
                let device = d.device();
                d.test_cases
                    .iter()
                    .map(move |t| PlannedTestRun::new(device.clone(), t.test_case()))
            })
            .collect()
    }

    /// Checks constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.automator.suite_name.trim().is_empty() {
            bail!("automator.suite_name must not be empty");
        }
        if self.automator.fatal_error_threshold <= self.automator.suspend_error_threshold {
            bail!(
                "automator.fatal_error_threshold ({}) must be greater than suspend_error_threshold ({})",
                self.automator.fatal_error_threshold,
                self.automator.suspend_error_threshold
            );
        }
        if self.devices.is_empty() {
            bail!("no devices configured");
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                bail!("device with empty name");
            }
            if !seen.insert(device.device()) {
                bail!("device {} is configured more than once", device.device());
            }
            if device.test_cases.is_empty() {
                bail!("device {} has no test cases", device.device());
            }
            for case in &device.test_cases {
                if case.name.trim().is_empty() {
                    bail!("device {} has a test case with empty name", device.device());
                }
                if case.timeout_mins == 0 {
                    bail!(
                        "test case {} on device {} has a zero timeout",
                        case.name,
                        device.device()
                    );
                }
            }
        }
        Ok(())
    }
}
