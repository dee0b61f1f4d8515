//! Remote execution client abstraction.
//!
//! The orchestrator never talks to the remote test-execution service
//! directly. It consumes exactly two operations through
//! [`RemoteExecutionClient`]:
//!
//! ```text
//!   Orchestrator                         RemoteExecutionClient
//!        │                                        │
//!        │ submit(device, test_case) ────────────►│
//!        │◄──── Accepted { execution_id }         │
//!        │◄──── Rejected { message }              │
//!        │◄──── Err(ClientError)                  │
//!        │                                        │
//!        │ fetch_result(execution_id) ───────────►│
//!        │◄──── Ready(ExecutionResult)            │
//!        │◄──── Pending                           │
//!        │◄──── Err(ClientError)                  │
//! ```
//!
//! Both operations report failure as values. A failed submission becomes an
//! `EXECERR` outcome, a failed fetch is counted against the run; neither can
//! skip the orchestrator's bookkeeping.
//!
//! # Built-in Clients
//!
//! | Client | Module | Description |
//! |--------|--------|-------------|
//! | Shell | [`shell`] | Delegates both calls to user-provided commands |

pub mod shell;

use async_trait::async_trait;

use crate::model::{Device, ExecutionResult, TestCase};

pub use shell::ShellClient;

/// Result type for remote client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Transport-level failures of a remote call.
///
/// These describe the call, not the test: a test that ran and failed is a
/// successful fetch returning a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A command template could not be parsed.
    #[error("Invalid command template: {0}")]
    InvalidCommand(String),

    /// The command could not be started.
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    /// The call did not complete within the configured limit.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The command ran but exited unsuccessfully.
    #[error("Command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// The service answered with something that could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// I/O error while talking to the service.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Answer to a submission request that reached the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    /// Execution started under the given identifier.
    Accepted { execution_id: String },
    /// The service declined (device busy or offline, unknown test case, ...).
    Rejected { message: String },
}

/// Answer to a non-blocking result poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The execution finished and produced a result.
    Ready(ExecutionResult),
    /// The execution has not produced a result yet.
    Pending,
}

/// Client for the remote test-execution service.
///
/// Calls may block on I/O for as long as they need; their latency simply
/// becomes part of the tick that made them.
#[async_trait]
pub trait RemoteExecutionClient: Send + Sync {
    /// Requests that the service start executing `test_case` on `device`.
    async fn submit(&self, device: &Device, test_case: &TestCase) -> ClientResult<SubmitResponse>;

    /// Polls for the result of a previously accepted execution.
    async fn fetch_result(&self, execution_id: &str) -> ClientResult<FetchOutcome>;

    /// Client name used in logs.
    fn name(&self) -> &str;
}
