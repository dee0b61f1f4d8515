//! Test run reporting.
//!
//! Every finished attempt is broadcast to the registered
//! [`TestRunListener`]s in registration order. Listeners receive shared
//! references to frozen runs and keep whatever state they need behind
//! their own locks.
//!
//! # Built-in Listeners
//!
//! | Listener | Module | Output |
//! |----------|--------|--------|
//! | [`ConsoleListener`] | [`console`] | Log lines, progress and a coloured summary |
//! | [`CsvListener`] | [`csv`] | One semicolon-separated row per attempt |
//! | [`JunitListener`] | [`junit`] | JUnit XML of the final attempts |

pub mod console;
pub mod csv;
pub mod junit;

use async_trait::async_trait;

use crate::model::TestRun;
use crate::orchestrator::RunSummary;

pub use self::console::ConsoleListener;
pub use self::csv::CsvListener;
pub use self::junit::JunitListener;

/// Snapshot of the queues, reported periodically by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Driver round the snapshot was taken in.
    pub round: u32,
    pub successes: usize,
    pub failures: usize,
    pub exec_errors: usize,
    pub timeouts: usize,
    pub retried: usize,
    /// Planned runs not yet dispatched.
    pub waiting: usize,
    /// Runs submitted and waiting for a result.
    pub in_process: usize,
}

impl Progress {
    /// Attempts that reached an outcome, retried ones included.
    pub fn done(&self) -> usize {
        self.successes + self.failures + self.exec_errors + self.timeouts + self.retried
    }
}

/// A consumer of finished test runs.
#[async_trait]
pub trait TestRunListener: Send + Sync {
    /// Called once per finished attempt.
    ///
    /// `is_final` is `false` when the attempt ended negatively and another
    /// attempt of the same planned run has been scheduled.
    async fn on_finish(&self, run: &TestRun, is_final: bool);

    /// Called with a progress snapshot on the driver's cadence.
    async fn on_progress(&self, _progress: &Progress) {}

    /// Called exactly once when the driver stops, also when it aborts.
    async fn on_all_finished(&self, summary: &RunSummary);
}
