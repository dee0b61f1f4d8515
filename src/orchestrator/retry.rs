//! Bounded retry policy for negative outcomes.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ExecutionOutcome, PlannedTestRun};

/// Decides whether a finished, non-successful attempt is tried again.
///
/// Failures, execution errors and timeouts are all retried the same way:
/// while `attempt_count < max_retries` the next attempt is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

/// Result of applying a [`RetryPolicy`] to a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule this planned run; the finished attempt is not final.
    Retry(PlannedTestRun),
    /// No more attempts; the finished attempt is final.
    Final,
}

impl RetryDecision {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final)
    }
}

impl RetryPolicy {
    /// Create a policy allowing up to `max_retries` retries per planned run.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Check if another attempt of `planned` is allowed.
    pub fn should_retry(&self, planned: &PlannedTestRun) -> bool {
        planned.attempt_count() < self.max_retries
    }

    /// Decide what happens after `planned` finished with `outcome`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RetryOfSuccess`] for a successful
    /// outcome; a success is always final and never reaches the policy.
    pub fn decide(
        &self,
        planned: &PlannedTestRun,
        outcome: ExecutionOutcome,
    ) -> OrchestratorResult<RetryDecision> {
        if outcome.is_success() {
            return Err(OrchestratorError::RetryOfSuccess {
                run: planned.to_string(),
            });
        }
        if self.should_retry(planned) {
            Ok(RetryDecision::Retry(planned.with_incremented_attempt_count()))
        } else {
            Ok(RetryDecision::Final)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, TestCase};

    fn planned() -> PlannedTestRun {
        PlannedTestRun::new(Device::new("pixel"), TestCase::new("login"))
    }

    #[test]
    fn test_no_retries_by_default() {
        let policy = RetryPolicy::default();
        let decision = policy
            .decide(&planned(), ExecutionOutcome::Failure)
            .unwrap();
        assert!(decision.is_final());
    }

    #[test]
    fn test_retries_until_exhausted() {
        let policy = RetryPolicy::new(2);

        let first = planned();
        let RetryDecision::Retry(second) = policy.decide(&first, ExecutionOutcome::Timeout).unwrap()
        else {
            panic!("first attempt should be retried");
        };
        assert_eq!(second.attempt_count(), 1);

        let RetryDecision::Retry(third) = policy.decide(&second, ExecutionOutcome::ExecErr).unwrap()
        else {
            panic!("second attempt should be retried");
        };
        assert_eq!(third.attempt_count(), 2);

        assert_eq!(
            policy.decide(&third, ExecutionOutcome::Failure).unwrap(),
            RetryDecision::Final
        );
    }

    #[test]
    fn test_success_is_rejected() {
        let policy = RetryPolicy::new(3);
        let err = policy
            .decide(&planned(), ExecutionOutcome::Success)
            .unwrap_err();
        assert!(err.is_contract_violation());
    }
}
