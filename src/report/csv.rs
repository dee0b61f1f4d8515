//! Raw CSV log of every attempt.
//!
//! One semicolon-separated row is appended per finished attempt, including
//! attempts that are retried afterwards:
//!
//! ```text
//! device;testCase;result;finishedAt;requestedAt;submittedAt;executionId;fetchErrors;buildNumber;creationDate;endDate;willBeRetried
//! pixel;login;SUCCESS;2024-05-01T12:02:00+00:00;...;42;2024-05-01T12:00:05+00:00;2024-05-01T12:01:55+00:00;false
//! ```
//!
//! Fields that don't apply to an outcome (no execution id for `EXECERR`, no
//! build number for `TIMEOUT`, ...) are left empty.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::TestRunListener;
use crate::model::TestRun;
use crate::orchestrator::RunSummary;

const HEADER: &str = "device;testCase;result;finishedAt;requestedAt;submittedAt;executionId;fetchErrors;buildNumber;creationDate;endDate;willBeRetried";

/// Listener appending one CSV row per finished attempt.
pub struct CsvListener {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CsvListener {
    /// Creates (or truncates) the CSV file and writes the header.
    ///
    /// Parent directories are created automatically.
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let file = File::create(&path)
            .with_context(|| format!("Failed to create CSV file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", HEADER)?;
        writer.flush()?;

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn field(value: impl ToString) -> String {
    value.to_string().replace([';', '\n', '\r'], " ")
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn row(run: &TestRun, is_final: bool) -> String {
    let result = run.result();
    [
        field(run.device()),
        field(&run.test_case().name),
        run.outcome().map(|o| o.to_string()).unwrap_or_default(),
        timestamp(run.finished_at()),
        timestamp(Some(run.requested_at())),
        timestamp(run.submitted_at()),
        run.execution_id().map(field).unwrap_or_default(),
        run.fetch_errors().to_string(),
        result
            .and_then(|r| r.build_number)
            .map(|n| n.to_string())
            .unwrap_or_default(),
        timestamp(result.and_then(|r| r.created_at)),
        timestamp(result.and_then(|r| r.ended_at)),
        (!is_final).to_string(),
    ]
    .join(";")
}

#[async_trait]
impl TestRunListener for CsvListener {
    async fn on_finish(&self, run: &TestRun, is_final: bool) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let written = writeln!(writer, "{}", row(run, is_final)).and_then(|()| writer.flush());
        if let Err(e) = written {
            tracing::error!("Failed to write CSV row to {}: {}", self.path.display(), e);
        }
    }

    async fn on_all_finished(&self, summary: &RunSummary) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.flush() {
            tracing::error!("Failed to flush {}: {}", self.path.display(), e);
        } else {
            tracing::info!(
                "{} attempts written to: {}",
                summary.total_runs,
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    use crate::model::{Device, ExecutionResult, PlannedTestRun, Submission, TestCase};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::TimeDelta::seconds(secs)
    }

    fn planned() -> PlannedTestRun {
        PlannedTestRun::new(
            Device::new("pixel").with_udid("ABC"),
            TestCase::new("login").with_timeout(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/testRunsRaw.csv");
        let listener = CsvListener::create(&path).unwrap();

        let mut success = TestRun::new(planned(), t(0));
        success.accept("exec-1", t(1));
        success
            .record_result(
                ExecutionResult {
                    status: 0,
                    created_at: Some(t(5)),
                    ended_at: Some(t(50)),
                    build_number: Some(42),
                    key: "k".to_string(),
                    message: None,
                },
                t(55),
            )
            .unwrap();
        listener.on_finish(&success, true).await;

        let mut rejected = TestRun::new(planned().with_incremented_attempt_count(), t(60));
        rejected
            .reject(
                Submission::Rejected {
                    message: "busy; try later".to_string(),
                },
                t(61),
            )
            .unwrap();
        listener.on_finish(&rejected, false).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert_eq!(
            lines[1],
            "pixel (ABC);login;SUCCESS;2024-05-01T12:00:55+00:00;2024-05-01T12:00:00+00:00;\
             2024-05-01T12:00:01+00:00;exec-1;0;42;2024-05-01T12:00:05+00:00;\
             2024-05-01T12:00:50+00:00;false"
        );
        assert_eq!(
            lines[2],
            "pixel (ABC);login;EXECERR;2024-05-01T12:01:01+00:00;2024-05-01T12:01:00+00:00;\
             2024-05-01T12:01:01+00:00;;0;;;;true"
        );
    }

    #[test]
    fn test_field_strips_separators() {
        assert_eq!(field("a;b\nc"), "a b c");
    }
}
