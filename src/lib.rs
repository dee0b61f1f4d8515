//! automator: runs test cases on remote devices and collects their reports.
//!
//! A fixed set of (device, test case) pairs is executed through a remote
//! test-execution service. The engine submits one run per device at a time,
//! polls for results, enforces per-test timeouts, retries negative outcomes
//! a bounded number of times and broadcasts every finished attempt to a set
//! of listeners.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Model** ([`model`]): devices, test cases, planned runs and attempts
//! - **Client** ([`client`]): the two calls made to the remote service
//! - **Orchestrator** ([`orchestrator`]): queues, dispatch, polling, timeouts
//!   and retries, plus the [`Driver`](orchestrator::Driver) tick loop
//! - **Report** ([`report`]): console, CSV and JUnit XML listeners
//! - **Config** ([`config`]): the TOML suite file
//!
//! # Example
//!
//! ```no_run
//! use automator::config::load_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("automator.toml"))?;
//!     println!("{} planned runs", config.planned_runs().len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod report;

// Re-export commonly used types
pub use client::{RemoteExecutionClient, ShellClient};
pub use config::{Config, load_config};
pub use error::{OrchestratorError, OrchestratorResult};
pub use model::{Device, ExecutionOutcome, PlannedTestRun, TestCase, TestRun};
pub use orchestrator::{Driver, Orchestrator, RunSummary};
pub use report::TestRunListener;
