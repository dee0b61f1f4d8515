//! Test execution engine and orchestration.
//!
//! The orchestrator owns every queue of the system and performs one kind of
//! step per method. A [`Driver`] calls those steps in a fixed order once per
//! tick until no work remains.
//!
//! # Architecture
//!
//! ```text
//!                    enqueue()
//!                        │
//!                        ▼
//!   to-do: Device ─► VecDeque<PlannedTestRun>
//!                        │
//!                        │ dispatch_idle_devices()     RemoteExecutionClient
//!                        │   submit() ───────────────────────►│
//!          Rejected/Err  │◄─────────────────── Accepted ──────┤
//!        ┌───────────────┤                                    │
//!        │               ▼                                    │
//!        │  in-flight: Device ─► Vec<TestRun>                 │
//!        │               │                                    │
//!        │               │ poll_in_flight()                   │
//!        │               │   fetch_result() ─────────────────►│
//!        │               │◄──────────── Ready / Pending / Err ┘
//!        │               │ check_timeouts()
//!        ▼               ▼
//!   finish(run) ── RetryPolicy ──► enqueue(next attempt)
//!        │
//!        ▼
//!   finished: Device ─► Vec<TestRun> ──► TestRunListener::on_finish()
//! ```
//!
//! # Invariants
//!
//! - At most one run is in flight per device.
//! - A device key whose list becomes empty is removed from its map.
//! - Remaining work is the union of the to-do and in-flight queues.
//! - Listeners only ever see runs whose outcome is set.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use automator::clock::SystemClock;
//! use automator::client::ShellClient;
//! use automator::config::load_config;
//! use automator::orchestrator::{Driver, Orchestrator};
//! use automator::report::ConsoleListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("automator.toml"))?;
//!     let client = ShellClient::from_config(&config.client)?;
//!
//!     let mut orchestrator = Orchestrator::new(
//!         client,
//!         Arc::new(SystemClock),
//!         config.automator.orchestrator_settings(),
//!     );
//!     orchestrator.add_listener(Arc::new(ConsoleListener::new(&config.client.report_base_url)));
//!     for planned in config.planned_runs() {
//!         orchestrator.enqueue(planned);
//!     }
//!
//!     let driver = Driver::new(Duration::from_secs(5), 12);
//!     let summary = driver.run(&mut orchestrator).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod driver;
pub mod retry;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::client::{FetchOutcome, RemoteExecutionClient, SubmitResponse};
use crate::clock::Clock;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Device, ExecutionOutcome, PlannedTestRun, Submission, TestRun};
use crate::report::{Progress, TestRunListener};

pub use driver::Driver;
pub use retry::{RetryDecision, RetryPolicy};

/// Aggregated results of an entire suite run.
///
/// Outcome counters only count final attempts; attempts that were followed
/// by a retry are counted in `retried`. Every attempt is therefore counted
/// exactly once:
///
/// `total_runs == successes + failures + exec_errors + timeouts + retried`
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every planned run finished successfully |
/// | 1 | Some planned run ended negatively, or the run was aborted |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of attempts that reached an outcome.
    pub total_runs: usize,

    pub successes: usize,

    /// Final attempts whose test ran and failed.
    pub failures: usize,

    /// Final attempts the remote service could not start.
    pub exec_errors: usize,

    /// Final attempts without a result within their timeout.
    pub timeouts: usize,

    /// Attempts that ended negatively and were tried again.
    pub retried: usize,

    /// Distinct (device, test case) pairs among finished attempts.
    pub finished_planned_runs: usize,

    /// Wall-clock duration of the driver loop.
    pub duration: Duration,

    /// `true` if the loop stopped on an error instead of running out of work.
    pub aborted: bool,
}

impl RunSummary {
    /// Final attempts that did not succeed.
    pub fn negative_results(&self) -> usize {
        self.failures + self.exec_errors + self.timeouts
    }

    /// Returns `true` if the run completed and nothing ended negatively.
    ///
    /// # Example
    ///
    /// ```
    /// use automator::orchestrator::RunSummary;
    ///
    /// let summary = RunSummary {
    ///     total_runs: 3,
    ///     successes: 2,
    ///     retried: 1,
    ///     finished_planned_runs: 2,
    ///     ..Default::default()
    /// };
    ///
    /// assert!(summary.success());
    /// assert_eq!(summary.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        !self.aborted && self.negative_results() == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Engine settings of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,

    /// Fetch errors on one run after which all polling pauses.
    pub suspend_error_threshold: u32,

    /// Fetch errors on one run after which the tick aborts.
    pub fatal_error_threshold: u32,

    /// How long polling pauses once suspended.
    pub suspend_window: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            suspend_error_threshold: 3,
            fatal_error_threshold: 5,
            suspend_window: Duration::from_secs(7 * 60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    successes: usize,
    failures: usize,
    exec_errors: usize,
    timeouts: usize,
    retried: usize,
}

impl Tally {
    fn record(&mut self, outcome: ExecutionOutcome, is_final: bool) {
        if !is_final {
            self.retried += 1;
            return;
        }
        match outcome {
            ExecutionOutcome::Success => self.successes += 1,
            ExecutionOutcome::Failure => self.failures += 1,
            ExecutionOutcome::ExecErr => self.exec_errors += 1,
            ExecutionOutcome::Timeout => self.timeouts += 1,
        }
    }
}

/// Owns the queues and drives runs through their lifecycle.
///
/// All operations take `&mut self` and run sequentially inside one task;
/// the only suspension points are the calls into the client.
///
/// # Type Parameters
///
/// - `C`: The remote execution client type
pub struct Orchestrator<C> {
    client: C,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    to_do: BTreeMap<Device, VecDeque<PlannedTestRun>>,
    in_flight: BTreeMap<Device, Vec<TestRun>>,
    finished: BTreeMap<Device, Vec<TestRun>>,
    listeners: Vec<Arc<dyn TestRunListener>>,
    suspended_until: Option<DateTime<Utc>>,
    tally: Tally,
}

impl<C> Orchestrator<C>
where
    C: RemoteExecutionClient,
{
    pub fn new(client: C, clock: Arc<dyn Clock>, settings: OrchestratorSettings) -> Self {
        Self {
            client,
            clock,
            settings,
            to_do: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            finished: BTreeMap::new(),
            listeners: Vec::new(),
            suspended_until: None,
            tally: Tally::default(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn add_listener(&mut self, listener: Arc<dyn TestRunListener>) {
        self.listeners.push(listener);
    }

    /// Appends a planned run to the tail of its device's to-do queue.
    pub fn enqueue(&mut self, planned: PlannedTestRun) {
        debug!("Enqueued {}", planned);
        self.to_do
            .entry(planned.device().clone())
            .or_default()
            .push_back(planned);
    }

    /// Returns `true` while any run is waiting or in flight.
    pub fn has_remaining_work(&self) -> bool {
        !self.to_do.is_empty() || !self.in_flight.is_empty()
    }

    /// Number of planned runs waiting to be dispatched.
    pub fn to_do_len(&self) -> usize {
        self.to_do.values().map(VecDeque::len).sum()
    }

    /// Number of runs submitted and waiting for a result.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.values().map(Vec::len).sum()
    }

    /// Every finished attempt, grouped by device, in finishing order per device.
    pub fn finished_runs(&self) -> impl Iterator<Item = &TestRun> {
        self.finished.values().flatten()
    }

    /// Distinct (device, test case) pairs among finished attempts.
    pub fn finished_planned_runs_count(&self) -> usize {
        self.finished_runs()
            .map(|run| (run.device(), run.test_case()))
            .collect::<HashSet<_>>()
            .len()
    }

    /// Moment until which polling and timeout checks are paused, if any.
    pub fn suspended_until(&self) -> Option<DateTime<Utc>> {
        self.suspended_until
    }

    pub fn progress(&self, round: u32) -> Progress {
        Progress {
            round,
            successes: self.tally.successes,
            failures: self.tally.failures,
            exec_errors: self.tally.exec_errors,
            timeouts: self.tally.timeouts,
            retried: self.tally.retried,
            waiting: self.to_do_len(),
            in_process: self.in_flight_len(),
        }
    }

    pub fn summary(&self, duration: Duration) -> RunSummary {
        RunSummary {
            total_runs: self.finished_runs().count(),
            successes: self.tally.successes,
            failures: self.tally.failures,
            exec_errors: self.tally.exec_errors,
            timeouts: self.tally.timeouts,
            retried: self.tally.retried,
            finished_planned_runs: self.finished_planned_runs_count(),
            duration,
            aborted: false,
        }
    }

    /// Submits the head of the to-do queue of every device with nothing in flight.
    ///
    /// An accepted run enters the device's in-flight list. A rejected or
    /// failed submission finishes the run as `EXECERR` right away.
    ///
    /// # Errors
    ///
    /// Only contract violations; submission failures are outcomes.
    pub async fn dispatch_idle_devices(&mut self) -> OrchestratorResult<()> {
        let idle: Vec<Device> = self
            .to_do
            .keys()
            .filter(|device| !self.in_flight.contains_key(*device))
            .cloned()
            .collect();

        for device in idle {
            let Some(planned) = self.pop_to_do(&device) else {
                continue;
            };

            let mut run = TestRun::new(planned, self.clock.now());
            info!("Submitting {}", run);
            let response = self.client.submit(run.device(), run.test_case()).await;
            let at = self.clock.now();

            match response {
                Ok(SubmitResponse::Accepted { execution_id }) => {
                    debug!("{} accepted as execution {}", run, execution_id);
                    run.accept(execution_id, at);
                    self.in_flight.entry(device).or_default().push(run);
                }
                Ok(SubmitResponse::Rejected { message }) => {
                    warn!("{} was rejected: {}", run, message);
                    run.reject(Submission::Rejected { message }, at)?;
                    self.finish(run, ExecutionOutcome::ExecErr).await?;
                }
                Err(e) => {
                    warn!("Submitting {} failed: {}", run, e);
                    run.reject(
                        Submission::Failed {
                            message: e.to_string(),
                        },
                        at,
                    )?;
                    self.finish(run, ExecutionOutcome::ExecErr).await?;
                }
            }
        }

        Ok(())
    }

    /// Fetches the result of every in-flight run, unless polling is suspended.
    ///
    /// A fetch error only increments the run's error counter. Reaching the
    /// suspend threshold pauses all polling for the suspend window, starting
    /// with the remaining runs of this tick.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::FatalPoll`] once a run reaches the fatal
    /// threshold. The run stays in flight.
    pub async fn poll_in_flight(&mut self) -> OrchestratorResult<()> {
        let now = self.clock.now();
        if self.check_suspended(now) {
            debug!("Polling suspended, skipping {} in-flight runs", self.in_flight_len());
            return Ok(());
        }

        let devices: Vec<Device> = self.in_flight.keys().cloned().collect();
        for device in devices {
            let Some(runs) = self.in_flight.remove(&device) else {
                continue;
            };

            let mut waiting = Vec::with_capacity(runs.len());
            let mut done = Vec::new();
            let mut failure = None;
            let mut runs = runs.into_iter();

            for mut run in runs.by_ref() {
                if self.is_suspended(now) {
                    waiting.push(run);
                    continue;
                }
                let Some(execution_id) = run.execution_id().map(str::to_string) else {
                    waiting.push(run);
                    continue;
                };

                match self.client.fetch_result(&execution_id).await {
                    Ok(FetchOutcome::Pending) => {
                        debug!("{} still running", run);
                        waiting.push(run);
                    }
                    Ok(FetchOutcome::Ready(result)) => {
                        match run.record_result(result, self.clock.now()) {
                            Ok(outcome) => done.push((run, outcome)),
                            Err(e) => {
                                waiting.push(run);
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let errors = run.record_fetch_error();
                        if errors >= self.settings.fatal_error_threshold {
                            failure = Some(OrchestratorError::FatalPoll {
                                device: run.device().to_string(),
                                test_case: run.test_case().name.clone(),
                                execution_id,
                                errors,
                                source: e,
                            });
                            waiting.push(run);
                            break;
                        }
                        if errors >= self.settings.suspend_error_threshold {
                            self.suspend(now);
                            warn!(
                                "Fetching result of {} failed {} times ({}), suspending polling until {}",
                                run,
                                errors,
                                e,
                                self.suspended_until.unwrap_or(now)
                            );
                        } else {
                            warn!("Fetching result of {} failed ({} so far): {}", run, errors, e);
                        }
                        waiting.push(run);
                    }
                }
            }

            waiting.extend(runs);
            if !waiting.is_empty() {
                self.in_flight.insert(device, waiting);
            }
            for (run, outcome) in done {
                self.finish(run, outcome).await?;
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        Ok(())
    }

    /// Finishes every in-flight run that has exceeded its test case's timeout.
    ///
    /// Skipped while polling is suspended.
    pub async fn check_timeouts(&mut self) -> OrchestratorResult<()> {
        let now = self.clock.now();
        if self.check_suspended(now) {
            debug!("Polling suspended, skipping timeout checks");
            return Ok(());
        }

        let devices: Vec<Device> = self.in_flight.keys().cloned().collect();
        for device in devices {
            let Some(runs) = self.in_flight.remove(&device) else {
                continue;
            };
            let (overdue, waiting): (Vec<_>, Vec<_>) =
                runs.into_iter().partition(|run| run.is_overdue(now));
            if !waiting.is_empty() {
                self.in_flight.insert(device, waiting);
            }

            for mut run in overdue {
                warn!(
                    "{} produced no result within {} minutes",
                    run,
                    run.test_case().timeout.as_secs() / 60
                );
                run.set_outcome(ExecutionOutcome::Timeout, now)?;
                self.finish(run, ExecutionOutcome::Timeout).await?;
            }
        }

        Ok(())
    }

    /// Notifies every listener of a progress snapshot.
    pub async fn notify_progress(&self, progress: &Progress) {
        for listener in &self.listeners {
            listener.on_progress(progress).await;
        }
    }

    /// Notifies every listener that the run is over.
    pub async fn notify_all_finished(&self, summary: &RunSummary) {
        for listener in &self.listeners {
            listener.on_all_finished(summary).await;
        }
    }

    fn pop_to_do(&mut self, device: &Device) -> Option<PlannedTestRun> {
        let queue = self.to_do.get_mut(device)?;
        let planned = queue.pop_front();
        if queue.is_empty() {
            self.to_do.remove(device);
        }
        planned
    }

    fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        self.suspended_until.is_some_and(|until| now < until)
    }

    /// Like [`is_suspended`](Self::is_suspended), but clears an expired window.
    fn check_suspended(&mut self, now: DateTime<Utc>) -> bool {
        match self.suspended_until {
            Some(until) if now < until => true,
            Some(_) => {
                info!("Resuming polling");
                self.suspended_until = None;
                false
            }
            None => false,
        }
    }

    fn suspend(&mut self, now: DateTime<Utc>) {
        let until = TimeDelta::from_std(self.settings.suspend_window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.suspended_until = Some(until);
    }

    /// Applies the retry policy, records the run and notifies listeners.
    async fn finish(&mut self, run: TestRun, outcome: ExecutionOutcome) -> OrchestratorResult<()> {
        let is_final = if outcome.is_success() {
            true
        } else {
            match self.settings.retry.decide(run.planned(), outcome)? {
                RetryDecision::Retry(next) => {
                    info!("{} ended with {}, scheduling a retry", run, outcome);
                    self.enqueue(next);
                    false
                }
                RetryDecision::Final => true,
            }
        };
        self.tally.record(outcome, is_final);

        let device = run.device().clone();
        self.finished.entry(device.clone()).or_default().push(run);

        if let Some(run) = self.finished.get(&device).and_then(|runs| runs.last()) {
            for listener in &self.listeners {
                listener.on_finish(run, is_final).await;
            }
        }
        Ok(())
    }
}
