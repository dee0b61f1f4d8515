//! Log-based listener printing outcomes, progress and the final summary.

use std::time::Duration;

use ::console::style;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Progress, TestRunListener};
use crate::model::{ExecutionOutcome, ExecutionResult, TestRun};
use crate::orchestrator::RunSummary;

/// Logs every outcome through `tracing`, coloured with `console`.
///
/// Successes are logged at info level, everything else at warn level.
/// Identifiers, timestamps and report links go to debug level.
pub struct ConsoleListener {
    report_base_url: String,
}

impl ConsoleListener {
    pub fn new(report_base_url: impl Into<String>) -> Self {
        Self {
            report_base_url: report_base_url.into(),
        }
    }

    fn report_link(&self, run: &TestRun) -> Option<String> {
        run.result().map(|r| r.report_url(&self.report_base_url))
    }
}

/// Time the test took, as reported by the service or as observed locally.
fn run_duration(run: &TestRun) -> Option<Duration> {
    run.result().and_then(ExecutionResult::duration).or_else(|| {
        let finished = run.finished_at()?;
        run.submitted_at()
            .and_then(|submitted| (finished - submitted).to_std().ok())
    })
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m{:02}s", secs / 60, secs % 60)
}

/// A success that took less than a third of its timeout.
fn timeout_too_generous(run: &TestRun) -> bool {
    run.outcome() == Some(ExecutionOutcome::Success)
        && run_duration(run).is_some_and(|d| d * 3 < run.test_case().timeout)
}

#[async_trait]
impl TestRunListener for ConsoleListener {
    async fn on_finish(&self, run: &TestRun, is_final: bool) {
        let Some(outcome) = run.outcome() else {
            return;
        };

        let retry_note = if is_final { "" } else { ", will be retried" };
        let took = run_duration(run)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        match outcome {
            ExecutionOutcome::Success => {
                info!(
                    "{} {} ({})",
                    style("SUCCESS").green().bold(),
                    run,
                    took
                );
                if timeout_too_generous(run) {
                    info!(
                        "{} finished in {} with a timeout of {} minutes, consider lowering timeout",
                        run.test_case().name,
                        took,
                        run.test_case().timeout.as_secs() / 60
                    );
                }
            }
            ExecutionOutcome::Failure => {
                warn!(
                    "{} {} ({}{})",
                    style("FAILURE").red().bold(),
                    run,
                    took,
                    retry_note
                );
            }
            ExecutionOutcome::ExecErr => {
                warn!(
                    "{} {}: {}{}",
                    style("EXECERR").magenta().bold(),
                    run,
                    run.submission()
                        .and_then(|s| s.message())
                        .unwrap_or("no submission"),
                    retry_note
                );
            }
            ExecutionOutcome::Timeout => {
                warn!(
                    "{} {}: no report within {} minutes{}",
                    style("TIMEOUT").yellow().bold(),
                    run,
                    run.test_case().timeout.as_secs() / 60,
                    retry_note
                );
            }
        }

        debug!(
            "{}: execution {}, requested {}, submitted {}, finished {}, fetch errors {}",
            run,
            run.execution_id().unwrap_or("-"),
            run.requested_at(),
            run.submitted_at()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.finished_at()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.fetch_errors()
        );
        if let Some(link) = self.report_link(run) {
            debug!("{}: report {}", run, link);
        }
    }

    async fn on_progress(&self, progress: &Progress) {
        if progress.round == 0 {
            info!(
                "{}",
                style("Progress: attempts done (success/failures/execErrs/timeouts), waiting, inProcess, retried")
                    .dim()
            );
        }
        info!(
            "Progress: {} ({}/{}/{}/{}), {}, {}, {}",
            style(progress.done()).bold(),
            style(progress.successes).green(),
            style(progress.failures).red(),
            style(progress.exec_errors).magenta(),
            style(progress.timeouts).yellow(),
            progress.waiting,
            progress.in_process,
            progress.retried
        );
    }

    async fn on_all_finished(&self, summary: &RunSummary) {
        info!("Test Results:");
        info!("  Attempts:    {}", summary.total_runs);
        info!("  Planned:     {}", summary.finished_planned_runs);
        info!("  Success:     {}", style(summary.successes).green());
        info!("  Failures:    {}", style(summary.failures).red());
        info!("  Exec errors: {}", style(summary.exec_errors).magenta());
        info!("  Timeouts:    {}", style(summary.timeouts).yellow());
        info!("  Retried:     {}", summary.retried);
        info!("  Duration:    {}", format_duration(summary.duration));

        if summary.aborted {
            warn!("{}", style("Run aborted before all tests finished.").red().bold());
        } else if summary.success() {
            info!("{}", style("All tests passed!").green().bold());
        } else {
            warn!(
                "{}",
                style(format!("{} tests did not succeed.", summary.negative_results()))
                    .red()
                    .bold()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::model::{Device, PlannedTestRun, TestCase};

    fn run(timeout_mins: u64) -> TestRun {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let planned = PlannedTestRun::new(
            Device::new("pixel"),
            TestCase::new("login").with_timeout(Duration::from_secs(timeout_mins * 60)),
        );
        let mut run = TestRun::new(planned, t0);
        run.accept("exec-1", t0);
        run
    }

    fn result(status: i64, secs: i64) -> ExecutionResult {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ExecutionResult {
            status,
            created_at: Some(start),
            ended_at: Some(start + chrono::TimeDelta::seconds(secs)),
            build_number: Some(1),
            key: "key".to_string(),
            message: None,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0m00s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }

    #[test]
    fn test_generous_timeout_is_detected() {
        let mut fast = run(15);
        let at = fast.submitted_at().unwrap();
        fast.record_result(result(0, 60), at).unwrap();
        assert!(timeout_too_generous(&fast));

        let mut slow = run(15);
        slow.record_result(result(0, 600), at).unwrap();
        assert!(!timeout_too_generous(&slow));

        let mut failed = run(15);
        failed.record_result(result(1, 60), at).unwrap();
        assert!(!timeout_too_generous(&failed));
    }

    #[test]
    fn test_report_link() {
        let listener = ConsoleListener::new("https://reports.example.com/");
        let mut run = run(15);
        assert!(listener.report_link(&run).is_none());

        let at = run.submitted_at().unwrap();
        run.record_result(result(0, 1), at).unwrap();
        assert_eq!(
            listener.report_link(&run).as_deref(),
            Some("https://reports.example.com/index.html?reportDetail=key")
        );
    }
}
