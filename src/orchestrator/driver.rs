//! Tick loop driving an [`Orchestrator`] until no work remains.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{Orchestrator, RunSummary};
use crate::client::RemoteExecutionClient;
use crate::error::OrchestratorResult;

/// Round on which an early progress line is reported, before the regular cadence kicks in.
const EARLY_PROGRESS_ROUND: u32 = 6;

/// Runs the fixed tick sequence with a pause between ticks.
///
/// Each tick is: poll in-flight runs, check timeouts, dispatch idle devices,
/// report progress when due, sleep.
#[derive(Debug, Clone, Copy)]
pub struct Driver {
    poll_interval: Duration,
    progress_every: u32,
}

impl Driver {
    /// Creates a driver.
    ///
    /// # Arguments
    ///
    /// * `poll_interval` - Pause between two ticks
    /// * `progress_every` - Progress is reported every this many rounds (0 disables
    ///   the regular cadence; rounds 0 and 6 are always reported)
    pub fn new(poll_interval: Duration, progress_every: u32) -> Self {
        Self {
            poll_interval,
            progress_every,
        }
    }

    fn progress_due(&self, round: u32) -> bool {
        round == EARLY_PROGRESS_ROUND
            || (self.progress_every > 0 && round > 0 && round % self.progress_every == 0)
    }

    /// Runs ticks until the orchestrator has no remaining work.
    ///
    /// Every listener's `on_all_finished` is called exactly once, whether
    /// the loop ran out of work or stopped on an error.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a tick, after the summary hooks ran.
    pub async fn run<C>(&self, orchestrator: &mut Orchestrator<C>) -> OrchestratorResult<RunSummary>
    where
        C: RemoteExecutionClient,
    {
        let start = Instant::now();
        info!(
            "Running {} planned test runs with {}",
            orchestrator.to_do_len(),
            orchestrator.client().name()
        );

        let outcome = self.drive(orchestrator).await;

        let mut summary = orchestrator.summary(start.elapsed());
        summary.aborted = outcome.is_err();
        if let Err(e) = &outcome {
            error!("Aborting run: {}", e);
        }
        orchestrator.notify_all_finished(&summary).await;

        outcome.map(|()| summary)
    }

    async fn drive<C>(&self, orchestrator: &mut Orchestrator<C>) -> OrchestratorResult<()>
    where
        C: RemoteExecutionClient,
    {
        let mut round = 0;
        orchestrator
            .notify_progress(&orchestrator.progress(round))
            .await;

        while orchestrator.has_remaining_work() {
            debug!("Round {}", round);
            orchestrator.poll_in_flight().await?;
            orchestrator.check_timeouts().await?;
            orchestrator.dispatch_idle_devices().await?;

            if self.progress_due(round) {
                orchestrator
                    .notify_progress(&orchestrator.progress(round))
                    .await;
            }

            tokio::time::sleep(self.poll_interval).await;
            round += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::client::{ClientError, FetchOutcome};
    use crate::clock::SystemClock;
    use crate::error::OrchestratorError;
    use crate::model::{Device, ExecutionOutcome, ExecutionResult, PlannedTestRun, TestCase};
    use crate::orchestrator::tests::{RecordingListener, ScriptedClient};
    use crate::orchestrator::OrchestratorSettings;

    fn driver() -> Driver {
        Driver::new(Duration::from_millis(1), 2)
    }

    fn orchestrator() -> (Orchestrator<ScriptedClient>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let mut orchestrator = Orchestrator::new(
            ScriptedClient::default(),
            Arc::new(SystemClock),
            OrchestratorSettings::default(),
        );
        orchestrator.add_listener(listener.clone());
        orchestrator.enqueue(PlannedTestRun::new(
            Device::new("pixel"),
            TestCase::new("login"),
        ));
        (orchestrator, listener)
    }

    fn passed() -> ExecutionResult {
        ExecutionResult {
            status: 0,
            created_at: None,
            ended_at: None,
            build_number: None,
            key: "k".to_string(),
            message: None,
        }
    }

    #[test]
    fn test_progress_cadence() {
        let driver = Driver::new(Duration::ZERO, 12);
        let due: Vec<u32> = (0..30).filter(|r| driver.progress_due(*r)).collect();
        assert_eq!(due, vec![6, 12, 24]);

        let driver = Driver::new(Duration::ZERO, 0);
        let due: Vec<u32> = (0..30).filter(|r| driver.progress_due(*r)).collect();
        assert_eq!(due, vec![6]);
    }

    #[tokio::test]
    async fn test_run_until_no_work_remains() {
        let (mut orchestrator, listener) = orchestrator();
        orchestrator.client().push_fetch(Ok(FetchOutcome::Pending));
        orchestrator
            .client()
            .push_fetch(Ok(FetchOutcome::Ready(passed())));

        let summary = driver().run(&mut orchestrator).await.unwrap();

        assert!(!orchestrator.has_remaining_work());
        assert_eq!(summary.successes, 1);
        assert!(!summary.aborted);
        assert_eq!(summary.exit_code(), 0);

        let notifications = listener.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].outcome, Some(ExecutionOutcome::Success));

        let summaries = listener.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);

        // round 0 is always reported, round 2 by the cadence
        let rounds: Vec<u32> = listener
            .progress
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.round)
            .collect();
        assert_eq!(rounds, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_summary_hooks_run_on_abort() {
        let (mut orchestrator, listener) = orchestrator();
        for _ in 0..5 {
            orchestrator.client().push_fetch(Err(ClientError::Timeout(
                "fetch took too long".to_string(),
            )));
        }
        // keep polling despite the suspension by making the window empty
        orchestrator.settings.suspend_window = Duration::ZERO;

        let err = driver().run(&mut orchestrator).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::FatalPoll { errors: 5, .. }));

        let summaries = listener.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].aborted);
        assert_eq!(summaries[0].exit_code(), 1);
        assert!(listener.notifications.lock().unwrap().is_empty());
    }
}
