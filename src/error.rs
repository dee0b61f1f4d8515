//! Errors raised by the orchestration core.
//!
//! Submission failures and timeouts are never errors: they are outcomes
//! absorbed by the state machine and the retry policy. What remains here is
//! what aborts a tick:
//!
//! - **Fatal**: [`OrchestratorError::FatalPoll`], the remote service could not
//!   be reached for a single run too many times in a row.
//! - **Contract violations**: [`OrchestratorError::OutcomeAlreadySet`] and
//!   [`OrchestratorError::RetryOfSuccess`], programming faults that must stop
//!   the loop instead of silently continuing.

use crate::client::ClientError;
use crate::model::ExecutionOutcome;

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that propagate out of an orchestrator tick.
///
/// Every variant terminates the driver loop. The driver still calls the
/// listeners' summary hooks before returning the error.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Fetching the result of one run failed too many times.
    ///
    /// Repeated inability to reach the remote service is treated as an
    /// environment failure, not as a failure of the test.
    #[error(
        "Fetching result for {test_case} on {device} (execution {execution_id}) failed {errors} times"
    )]
    FatalPoll {
        device: String,
        test_case: String,
        execution_id: String,
        errors: u32,
        #[source]
        source: ClientError,
    },

    /// An outcome was set on a run that already had one.
    #[error("Outcome of {run} is already {existing}, refusing to overwrite it with {attempted}")]
    OutcomeAlreadySet {
        run: String,
        existing: ExecutionOutcome,
        attempted: ExecutionOutcome,
    },

    /// A successful run was handed to the retry decision.
    #[error("Successful run {run} must never be retried")]
    RetryOfSuccess { run: String },
}

impl OrchestratorError {
    /// Returns `true` for programming faults, as opposed to environment failures.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::OutcomeAlreadySet { .. } | Self::RetryOfSuccess { .. }
        )
    }
}
