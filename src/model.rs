//! Core entities: devices, test cases, planned runs and concrete attempts.
//!
//! The lifecycle of a single attempt is:
//!
//! ```text
//!                  submit ok            Ready(status == 0)
//!   ┌─────────┐ ───────────► ┌───────────┐ ─────────────────► SUCCESS
//!   │ Pending │              │ Submitted │ ─────────────────► FAILURE
//!   └─────────┘              └───────────┘  Ready(status != 0)
//!        │                         │
//!        │ rejected / error        │ elapsed > test_case.timeout
//!        ▼                         ▼
//!     EXECERR                   TIMEOUT
//! ```
//!
//! A [`PlannedTestRun`] is the intent ("run this test case on this device"),
//! a [`TestRun`] is one attempt at it. Retries create new planned runs with
//! an incremented attempt counter; nothing here is ever rewound.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Timeout applied to test cases that don't configure one.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// A target endpoint that test cases are executed on.
///
/// Identity is the pair (name, unique device id). Two devices with the same
/// name but different ids are different queue keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub udid: Option<String>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            udid: None,
        }
    }

    pub fn with_udid(mut self, udid: impl Into<String>) -> Self {
        self.udid = Some(udid.into());
        self
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.udid {
            Some(udid) => write!(f, "{} ({})", self.name, udid),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A named unit of work with its own execution timeout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestCase {
    pub name: String,
    /// Maximum wall-clock time between submission and a result.
    pub timeout: Duration,
    /// Optional execution specification forwarded to the remote service.
    pub specification: Option<String>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TEST_TIMEOUT,
            specification: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_specification(mut self, specification: impl Into<String>) -> Self {
        self.specification = Some(specification.into());
        self
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.specification {
            Some(spec) => write!(f, "{} [{}]", self.name, spec),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A queued intent to execute a test case on a device.
///
/// Immutable: a retry is expressed by building a new value with
/// [`with_incremented_attempt_count`](Self::with_incremented_attempt_count).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlannedTestRun {
    device: Device,
    test_case: TestCase,
    attempt_count: u32,
}

impl PlannedTestRun {
    /// Creates a first attempt (`attempt_count == 0`).
    pub fn new(device: Device, test_case: TestCase) -> Self {
        Self {
            device,
            test_case,
            attempt_count: 0,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    /// Number of attempts made for this intent before this one.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Returns the planned run for the next attempt of the same intent.
    pub fn with_incremented_attempt_count(&self) -> Self {
        Self {
            device: self.device.clone(),
            test_case: self.test_case.clone(),
            attempt_count: self.attempt_count + 1,
        }
    }
}

impl fmt::Display for PlannedTestRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} (attempt {})",
            self.test_case.name, self.device, self.attempt_count
        )
    }
}

/// Terminal classification of a [`TestRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionOutcome {
    /// The device executed the test and every assertion passed.
    Success,
    /// The device executed the test and at least one assertion failed.
    Failure,
    /// The remote service refused or could not accept the execution
    /// (device offline, unknown test case, service error).
    ExecErr,
    /// No result arrived within the test case's timeout.
    Timeout,
}

impl ExecutionOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::ExecErr => write!(f, "EXECERR"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Result payload reported by the remote service for a finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `0` means the test passed, anything else that it failed.
    pub status: i64,

    #[serde(rename = "creation_date", default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(rename = "end_date", default)]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub build_number: Option<i64>,

    /// Opaque key identifying the human-readable report.
    #[serde(rename = "key_string", default)]
    pub key: String,

    #[serde(default)]
    pub message: Option<String>,
}

impl ExecutionResult {
    pub fn passed(&self) -> bool {
        self.status == 0
    }

    /// Outcome implied by the reported status.
    pub fn outcome(&self) -> ExecutionOutcome {
        if self.passed() {
            ExecutionOutcome::Success
        } else {
            ExecutionOutcome::Failure
        }
    }

    /// Duration as measured by the remote service, if it reported both ends.
    pub fn duration(&self) -> Option<Duration> {
        match (self.created_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    /// Builds the link to the human-readable report.
    pub fn report_url(&self, base_url: &str) -> String {
        format!(
            "{}/index.html?reportDetail={}",
            base_url.trim_end_matches('/'),
            self.key
        )
    }
}

/// What happened when a run was handed to the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The service started an execution.
    Accepted { execution_id: String },
    /// The service answered but declined to start the execution.
    Rejected { message: String },
    /// The submission call itself failed.
    Failed { message: String },
}

impl Submission {
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::Accepted { execution_id } => Some(execution_id),
            _ => None,
        }
    }

    /// Human-readable explanation of a refused submission.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { message } | Self::Failed { message } => Some(message),
        }
    }
}

/// Observable state of a [`TestRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, not (successfully) submitted yet.
    Pending,
    /// Accepted by the remote service, waiting for a result.
    Submitted,
    /// Outcome recorded; the run never changes again.
    Finished(ExecutionOutcome),
}

/// One concrete attempt at executing a [`PlannedTestRun`].
///
/// The outcome is a one-shot field: [`set_outcome`](Self::set_outcome)
/// fails with [`OrchestratorError::OutcomeAlreadySet`] on a second call.
#[derive(Debug, Clone)]
pub struct TestRun {
    planned: PlannedTestRun,
    requested_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    submission: Option<Submission>,
    fetch_errors: u32,
    outcome: Option<ExecutionOutcome>,
    result: Option<ExecutionResult>,
}

impl TestRun {
    /// Creates an attempt whose submission is about to be requested at `requested_at`.
    pub fn new(planned: PlannedTestRun, requested_at: DateTime<Utc>) -> Self {
        Self {
            planned,
            requested_at,
            submitted_at: None,
            finished_at: None,
            submission: None,
            fetch_errors: 0,
            outcome: None,
            result: None,
        }
    }

    pub fn planned(&self) -> &PlannedTestRun {
        &self.planned
    }

    pub fn device(&self) -> &Device {
        self.planned.device()
    }

    pub fn test_case(&self) -> &TestCase {
        self.planned.test_case()
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// When the submit call returned, whether it was accepted or not.
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn submission(&self) -> Option<&Submission> {
        self.submission.as_ref()
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.submission.as_ref().and_then(Submission::execution_id)
    }

    pub fn fetch_errors(&self) -> u32 {
        self.fetch_errors
    }

    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        self.outcome
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    pub fn state(&self) -> RunState {
        match (self.outcome, &self.submission) {
            (Some(outcome), _) => RunState::Finished(outcome),
            (None, Some(Submission::Accepted { .. })) => RunState::Submitted,
            (None, _) => RunState::Pending,
        }
    }

    /// Records that the remote service accepted the execution.
    pub fn accept(&mut self, execution_id: impl Into<String>, at: DateTime<Utc>) {
        self.submitted_at = Some(at);
        self.submission = Some(Submission::Accepted {
            execution_id: execution_id.into(),
        });
    }

    /// Records a refused or failed submission and finishes the run as `EXECERR`.
    pub fn reject(&mut self, submission: Submission, at: DateTime<Utc>) -> OrchestratorResult<()> {
        self.submitted_at = Some(at);
        self.submission = Some(submission);
        self.set_outcome(ExecutionOutcome::ExecErr, at)
    }

    /// Sets the terminal outcome. May succeed only once per run.
    pub fn set_outcome(
        &mut self,
        outcome: ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if let Some(existing) = self.outcome {
            return Err(OrchestratorError::OutcomeAlreadySet {
                run: self.planned.to_string(),
                existing,
                attempted: outcome,
            });
        }
        self.finished_at = Some(at);
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Stores the remote result and derives the outcome from its status.
    pub fn record_result(
        &mut self,
        result: ExecutionResult,
        at: DateTime<Utc>,
    ) -> OrchestratorResult<ExecutionOutcome> {
        let outcome = result.outcome();
        self.set_outcome(outcome, at)?;
        self.result = Some(result);
        Ok(outcome)
    }

    /// Counts a failed poll and returns the new total for this run.
    pub fn record_fetch_error(&mut self) -> u32 {
        self.fetch_errors += 1;
        self.fetch_errors
    }

    /// Wall-clock time since the submission returned (zero before that).
    pub fn elapsed_since_submission(&self, now: DateTime<Utc>) -> Duration {
        self.submitted_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Returns `true` once a submitted run has been waiting longer than its timeout.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state() == RunState::Submitted
            && self.elapsed_since_submission(now) > self.test_case().timeout
    }
}

impl fmt::Display for TestRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn planned() -> PlannedTestRun {
        PlannedTestRun::new(
            Device::new("pixel").with_udid("ABC"),
            TestCase::new("login").with_timeout(Duration::from_secs(60)),
        )
    }

    #[test]
    fn test_device_identity_includes_udid() {
        let a = Device::new("pixel").with_udid("1");
        let b = Device::new("pixel").with_udid("2");
        assert_ne!(a, b);
        assert_eq!(a, Device::new("pixel").with_udid("1"));
        assert_eq!(a.to_string(), "pixel (1)");
        assert_eq!(Device::new("iphone").to_string(), "iphone");
    }

    #[test]
    fn test_test_case_defaults_to_fifteen_minutes() {
        let case = TestCase::new("login");
        assert_eq!(case.timeout, Duration::from_secs(900));
        assert!(case.specification.is_none());
    }

    #[test]
    fn test_incremented_attempt_leaves_original_untouched() {
        let first = planned();
        let second = first.with_incremented_attempt_count();
        assert_eq!(first.attempt_count(), 0);
        assert_eq!(second.attempt_count(), 1);
        assert_eq!(second.device(), first.device());
        assert_eq!(second.test_case(), first.test_case());
    }

    #[test]
    fn test_outcome_can_be_set_only_once() {
        let mut run = TestRun::new(planned(), t0());
        run.accept("exec-1", t0());
        run.set_outcome(ExecutionOutcome::Timeout, t0()).unwrap();

        let err = run
            .set_outcome(ExecutionOutcome::Success, t0())
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert!(matches!(
            err,
            OrchestratorError::OutcomeAlreadySet {
                existing: ExecutionOutcome::Timeout,
                attempted: ExecutionOutcome::Success,
                ..
            }
        ));
        assert_eq!(run.outcome(), Some(ExecutionOutcome::Timeout));
    }

    #[test]
    fn test_state_transitions() {
        let mut run = TestRun::new(planned(), t0());
        assert_eq!(run.state(), RunState::Pending);
        assert!(run.execution_id().is_none());

        run.accept("exec-1", t0());
        assert_eq!(run.state(), RunState::Submitted);
        assert_eq!(run.execution_id(), Some("exec-1"));

        let result = ExecutionResult {
            status: 3,
            created_at: None,
            ended_at: None,
            build_number: Some(7),
            key: "k".to_string(),
            message: None,
        };
        let outcome = run.record_result(result, t0()).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Failure);
        assert_eq!(run.state(), RunState::Finished(ExecutionOutcome::Failure));
        assert_eq!(run.result().map(|r| r.build_number), Some(Some(7)));
    }

    #[test]
    fn test_rejected_submission_is_execerr_without_execution_id() {
        let mut run = TestRun::new(planned(), t0());
        run.reject(
            Submission::Rejected {
                message: "device offline".to_string(),
            },
            t0(),
        )
        .unwrap();

        assert_eq!(run.outcome(), Some(ExecutionOutcome::ExecErr));
        assert!(run.execution_id().is_none());
        assert_eq!(
            run.submission().and_then(Submission::message),
            Some("device offline")
        );
    }

    #[test]
    fn test_overdue_only_after_timeout() {
        let mut run = TestRun::new(planned(), t0());
        assert!(!run.is_overdue(t0() + chrono::Duration::hours(1)));

        run.accept("exec-1", t0());
        assert!(!run.is_overdue(t0() + chrono::Duration::seconds(60)));
        assert!(run.is_overdue(t0() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_fetch_error_counter_is_monotonic() {
        let mut run = TestRun::new(planned(), t0());
        assert_eq!(run.record_fetch_error(), 1);
        assert_eq!(run.record_fetch_error(), 2);
        assert_eq!(run.fetch_errors(), 2);
    }

    #[test]
    fn test_execution_result_from_json() {
        let json = r#"{
            "status": 0,
            "creation_date": "2024-05-01T12:00:00Z",
            "end_date": "2024-05-01T12:02:30Z",
            "build_number": 42,
            "key_string": "agxzfmphbW8"
        }"#;
        let result: ExecutionResult = serde_json::from_str(json).unwrap();
        assert!(result.passed());
        assert_eq!(result.duration(), Some(Duration::from_secs(150)));
        assert_eq!(
            result.report_url("https://jamo.example.com/"),
            "https://jamo.example.com/index.html?reportDetail=agxzfmphbW8"
        );
    }
}
