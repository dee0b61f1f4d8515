//! JUnit XML report generation.
//!
//! Only final attempts are reported; an attempt that was retried is
//! superseded by its successor. CI servers pick the file up like any other
//! Surefire report.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuite name="com.jamosolutions.smoke" tests="3" failures="1" errors="1" time="612.000">
//!   <testcase name="login" classname="com.jamosolutions.smoke.pixel" time="95.000">
//!     <system-out>https://reports.example.com/index.html?reportDetail=abc</system-out>
//!   </testcase>
//!   <testcase name="logout" classname="com.jamosolutions.smoke.pixel" time="120.000">
//!     <failure message="The test case did not succeed.">https://reports.example.com/index.html?reportDetail=def</failure>
//!   </testcase>
//!   <testcase name="search" classname="com.jamosolutions.smoke.iphone" time="900.000">
//!     <error message="could not find any report within 15 minutes (execution id 1234)"/>
//!   </testcase>
//! </testsuite>
//! ```
//!
//! # Example
//!
//! ```
//! use automator::report::JunitListener;
//!
//! let listener = JunitListener::new("target/surefire-reports", "smoke", "https://jamo-release.appspot.com")
//!     .with_package("com.example");
//! assert!(listener.output_path().ends_with("TEST-com.example.smoke.xml"));
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::TestRunListener;
use crate::model::{ExecutionOutcome, ExecutionResult, TestRun};
use crate::orchestrator::RunSummary;

const FAILURE_MESSAGE: &str = "The test case did not succeed.";

#[derive(Default)]
struct Collected {
    runs: Vec<TestRun>,
    earliest_request: Option<DateTime<Utc>>,
    latest_finish: Option<DateTime<Utc>>,
}

/// Listener that writes a JUnit XML report when the run completes.
///
/// # File Location
///
/// `{output_dir}/TEST-{package}.{suite}.xml`. Parent directories are
/// created automatically; an existing file is overwritten.
pub struct JunitListener {
    output_dir: PathBuf,
    suite_name: String,
    package: String,
    report_base_url: String,
    collected: Mutex<Collected>,
}

impl JunitListener {
    /// Creates a new JUnit listener.
    ///
    /// # Arguments
    ///
    /// * `output_dir` - Directory receiving the XML file
    /// * `suite_name` - Suite name, part of the file and class names
    /// * `report_base_url` - Base URL of the human-readable reports
    pub fn new(
        output_dir: impl Into<PathBuf>,
        suite_name: impl Into<String>,
        report_base_url: impl Into<String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            suite_name: suite_name.into(),
            package: "com.jamosolutions".to_string(),
            report_base_url: report_base_url.into(),
            collected: Mutex::new(Collected::default()),
        }
    }

    /// Sets the class name prefix. The default is `"com.jamosolutions"`.
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        self
    }

    fn qualified_suite(&self) -> String {
        format!("{}.{}", self.package, self.suite_name)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("TEST-{}.xml", self.qualified_suite()))
    }

    /// Generate JUnit XML content from the collected runs.
    fn generate_xml(&self) -> anyhow::Result<String> {
        let collected = self.collected.lock().unwrap_or_else(|e| e.into_inner());
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let count = |outcome: ExecutionOutcome| {
            collected
                .runs
                .iter()
                .filter(|r| r.outcome() == Some(outcome))
                .count()
        };
        let tests = collected.runs.len();
        let failures = count(ExecutionOutcome::Failure);
        let errors = count(ExecutionOutcome::ExecErr) + count(ExecutionOutcome::Timeout);
        let time = match (collected.earliest_request, collected.latest_finish) {
            (Some(start), Some(end)) => seconds(start, end),
            _ => 0.0,
        };

        let suite_name = self.qualified_suite();
        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", suite_name.as_str()));
        testsuite.push_attribute(("tests", tests.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", errors.to_string().as_str()));
        testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for run in &collected.runs {
            self.write_testcase(&mut writer, run)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }

    /// Write a single test case element.
    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        run: &TestRun,
    ) -> anyhow::Result<()> {
        let classname = format!("{}.{}", self.qualified_suite(), run.device());
        // the service's own dates win over the locally observed span
        let time = match (
            run.result().and_then(ExecutionResult::duration),
            run.submitted_at(),
            run.finished_at(),
        ) {
            (Some(reported), _, _) => reported.as_secs_f64(),
            (None, Some(start), Some(end)) => seconds(start, end),
            _ => 0.0,
        };

        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("name", sanitize(&run.test_case().name).as_str()));
        testcase.push_attribute(("classname", sanitize(&classname).as_str()));
        testcase.push_attribute(("time", format!("{:.3}", time).as_str()));
        writer.write_event(Event::Start(testcase))?;

        let link = run
            .result()
            .map(|r| r.report_url(&self.report_base_url))
            .unwrap_or_default();

        match run.outcome() {
            Some(ExecutionOutcome::Success) => {
                writer.write_event(Event::Start(BytesStart::new("system-out")))?;
                writer.write_event(Event::Text(BytesText::new(&link)))?;
                writer.write_event(Event::End(BytesEnd::new("system-out")))?;
            }
            Some(ExecutionOutcome::Failure) => {
                let mut failure = BytesStart::new("failure");
                failure.push_attribute(("message", FAILURE_MESSAGE));
                writer.write_event(Event::Start(failure))?;
                writer.write_event(Event::Text(BytesText::new(&link)))?;
                writer.write_event(Event::End(BytesEnd::new("failure")))?;
            }
            Some(ExecutionOutcome::Timeout) => {
                let message = format!(
                    "could not find any report within {} minutes (execution id {})",
                    run.test_case().timeout.as_secs() / 60,
                    run.execution_id().unwrap_or("-")
                );
                let mut error = BytesStart::new("error");
                error.push_attribute(("message", sanitize(&message).as_str()));
                writer.write_event(Event::Empty(error))?;
            }
            Some(ExecutionOutcome::ExecErr) => {
                let message = run
                    .submission()
                    .and_then(|s| s.message())
                    .unwrap_or("execution could not be started");
                let mut error = BytesStart::new("error");
                error.push_attribute(("message", sanitize(message).as_str()));
                writer.write_event(Event::Empty(error))?;
            }
            None => {}
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }
}

fn seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

/// Drop characters that are not allowed in XML documents.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl TestRunListener for JunitListener {
    async fn on_finish(&self, run: &TestRun, is_final: bool) {
        let mut collected = self.collected.lock().unwrap_or_else(|e| e.into_inner());

        let requested = run.requested_at();
        collected.earliest_request = Some(
            collected
                .earliest_request
                .map_or(requested, |t| t.min(requested)),
        );
        if let Some(finished) = run.finished_at() {
            collected.latest_finish =
                Some(collected.latest_finish.map_or(finished, |t| t.max(finished)));
        }

        if is_final {
            collected.runs.push(run.clone());
        }
    }

    async fn on_all_finished(&self, _summary: &RunSummary) {
        let output_path = self.output_path();
        match self.generate_xml() {
            Ok(xml) => {
                if !self.output_dir.exists()
                    && let Err(e) = std::fs::create_dir_all(&self.output_dir)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}
