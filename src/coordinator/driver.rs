//! Job driver
//!
//! Top-level control loop of a master: win the election, create the input
//! splits, run superstep rounds until every vertex halted, restart from the
//! newest checkpoint when a worker is lost, then clean up.

use tracing::{debug, error, info, warn};

use super::assignment::create_input_splits;
use super::barrier::{SuperstepCoordinator, SuperstepState};
use super::job_state::JobState;
use super::leader::LeaderElector;
use super::MasterContext;
use crate::coordination::{self, CreateMode};
use crate::error::{BspError, Result};

/// How a master's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another master finished the job first
    NotMaster,
    /// Every vertex halted after `supersteps` rounds
    Finished { supersteps: u64, restarts: u32 },
}

/// Runs one master candidate to completion
pub struct MasterDriver {
    ctx: MasterContext,
}

impl MasterDriver {
    pub fn new(ctx: MasterContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &MasterContext {
        &self.ctx
    }

    /// Apply a configured restart point before anything else runs
    fn setup(&self) {
        if let Some(restart) = self.ctx.config.restart_superstep {
            info!("setup: restarting from superstep {}", restart);
            self.ctx.tracker.restore(restart);
        }
    }

    /// Run the job; any error marks the job failed before it is returned
    pub async fn run(&self) -> Result<JobOutcome> {
        self.setup();
        if !LeaderElector::new(&self.ctx).become_master().await? {
            return Ok(JobOutcome::NotMaster);
        }
        match self.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("run: job failed: {}", e);
                self.mark_failed().await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self) {
        let already_failed = matches!(
            self.ctx.job_state.latest(false).await,
            Ok(Some(record)) if record.state == JobState::Failed
        );
        if already_failed {
            return;
        }
        let (attempt, superstep) = self.ctx.tracker.position();
        if let Err(e) = self
            .ctx
            .job_state
            .publish(JobState::Failed, attempt, superstep)
            .await
        {
            warn!("mark_failed: could not publish failed state: {}", e);
        }
    }

    async fn drive(&self) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        if ctx.tracker.superstep() == 0 && !ctx.tracker.is_restart_superstep() {
            let splits = create_input_splits(ctx).await?;
            info!("drive: {} input splits", splits);
            ctx.job_state
                .publish(JobState::InputSuperstep, ctx.tracker.application_attempt(), 0)
                .await?;
        }

        let coordinator = SuperstepCoordinator::new(ctx);
        let mut restarts = 0u32;
        let mut state = SuperstepState::Initial;
        loop {
            let (attempt, superstep) = ctx.tracker.position();
            ctx.job_state
                .publish(JobState::StartSuperstep, attempt, superstep)
                .await?;
            let next = coordinator.coordinate_superstep().await?;
            debug!("drive: superstep {} went {:?} -> {:?}", superstep, state, next);
            state = next;

            match state {
                SuperstepState::ThisSuperstepDone | SuperstepState::Initial => {}
                SuperstepState::AllSuperstepsDone => {
                    ctx.job_state
                        .publish(JobState::Finished, attempt, superstep)
                        .await?;
                    self.cleanup().await;
                    let supersteps = ctx.tracker.superstep();
                    info!(
                        "drive: job finished after {} supersteps and {} restarts",
                        supersteps, restarts
                    );
                    return Ok(JobOutcome::Finished {
                        supersteps,
                        restarts,
                    });
                }
                SuperstepState::WorkerFailure => {
                    let checkpoint = match ctx.checkpoints.last_good_checkpoint().await? {
                        Some(checkpoint) => checkpoint,
                        None => {
                            ctx.job_state
                                .publish(JobState::Failed, attempt, superstep)
                                .await?;
                            return Err(BspError::UnrecoverableWorkerFailure { superstep });
                        }
                    };
                    if restarts >= ctx.config.max_restart_attempts {
                        ctx.job_state
                            .publish(JobState::Failed, attempt, superstep)
                            .await?;
                        return Err(BspError::RestartLimitExceeded { attempts: restarts });
                    }
                    restarts += 1;
                    self.restart_from_checkpoint(checkpoint).await?;
                }
            }
        }
    }

    /// Drop the input splits and move to a fresh attempt at `checkpoint`
    pub async fn restart_from_checkpoint(&self, checkpoint: u64) -> Result<()> {
        let ctx = &self.ctx;
        let client = ctx.client.as_ref();
        coordination::delete_if_present(client, &ctx.paths.input_splits()).await?;
        coordination::delete_if_present(client, &ctx.paths.input_splits_all_ready()).await?;
        let attempt = ctx.tracker.restart_at(checkpoint);
        warn!(
            "restart_from_checkpoint: worker failure, restarting from superstep {} on attempt {}",
            checkpoint, attempt
        );
        Ok(())
    }

    /// Leave a cleaned-up marker, wait for every task's marker, then remove
    /// the job's coordination state and optionally its checkpoints.
    ///
    /// Failures here are logged only.
    pub async fn cleanup(&self) {
        let ctx = &self.ctx;
        let client = ctx.client.as_ref();
        let dir = ctx.paths.cleaned_up_dir();
        let marker = coordination::join(&dir, &format!("{}_master", ctx.config.partition_id));
        match coordination::create_if_absent(client, &marker, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) => info!("cleanup: notified cleanup with {}", marker),
            Err(e) => error!("cleanup: could not create {}: {}", marker, e),
        }

        let expected = ctx.config.expected_cleanup_tasks;
        let changed = &ctx.events.cleaned_up_changed;
        loop {
            changed.reset();
            let done = match coordination::children_or_empty(client, &dir, true).await {
                Ok(children) => children.len(),
                Err(e) => {
                    error!("cleanup: cannot list {}: {}", dir, e);
                    return;
                }
            };
            info!("cleanup: got {} of {} cleaned-up markers", done, expected);
            if done >= expected {
                break;
            }
            changed.wait().await;
        }

        if !ctx.config.keep_coordination_data {
            info!("cleanup: removing {} and all children", ctx.paths.base());
            if let Err(e) = coordination::delete_if_present(client, ctx.paths.base()).await {
                error!("cleanup: failed to remove {}: {}", ctx.paths.base(), e);
            }
        }
        if ctx.config.checkpoint.cleanup_after_success {
            match ctx.checkpoints.delete_all().await {
                Ok(removed) => info!(
                    "cleanup: removed {} checkpoint objects since the job succeeded",
                    removed
                ),
                Err(e) => error!("cleanup: failed to remove checkpoints: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::coordination::CoordinationClient;
    use crate::coordinator::test_support::Harness;
    use std::time::Duration;

    fn config() -> MasterConfig {
        let mut config = MasterConfig::default();
        config.health.poll_period = Duration::from_millis(20);
        config.health.max_poll_attempts = 2;
        config
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_every_task() {
        let harness = Harness::new();
        let mut config = config();
        config.expected_cleanup_tasks = 2;
        let master = harness.master(config);
        let driver = MasterDriver::new(master.ctx.clone());
        let session = harness.session();
        let paths = harness.paths();
        session
            .create(&paths.job_state_dir(), Vec::new(), CreateMode::Persistent, true)
            .await
            .unwrap();

        let cleanup = tokio::spawn(async move { driver.cleanup().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cleanup.is_finished());
        assert!(session.exists(paths.base(), false).await.unwrap());

        let marker = coordination::join(&paths.cleaned_up_dir(), "1_worker");
        session
            .create(&marker, Vec::new(), CreateMode::Persistent, true)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), cleanup)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.exists(paths.base(), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_drops_input_splits() {
        let harness = Harness::new();
        let master = harness.master(config());
        let session = harness.session();
        let paths = harness.paths();
        session
            .create(&paths.input_split_finished(0), Vec::new(), CreateMode::Persistent, true)
            .await
            .unwrap();
        for _ in 0..6 {
            master.ctx.tracker.advance();
        }

        let driver = MasterDriver::new(master.ctx.clone());
        driver.restart_from_checkpoint(4).await.unwrap();
        assert!(!session.exists(&paths.input_splits(), false).await.unwrap());
        assert_eq!(master.ctx.tracker.position(), (1, 4));
        assert!(master.ctx.tracker.is_restart_superstep());
    }

    #[tokio::test]
    async fn test_quorum_failure_marks_job_failed_once() {
        let harness = Harness::new();
        let master = harness.master(config());
        let driver = MasterDriver::new(master.ctx.clone());

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, BspError::QuorumNotMet { .. }));
        let session = harness.session();
        let entries = session
            .get_children(&harness.paths().job_state_dir(), false)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let latest = master.ctx.job_state.latest(false).await.unwrap().unwrap();
        assert_eq!(latest.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_configured_restart_skips_input() {
        let harness = Harness::new();
        let mut config = config();
        config.restart_superstep = Some(3);
        let master = harness.master(config);
        let driver = MasterDriver::new(master.ctx.clone());

        // No workers ever register, so the first round fails its quorum
        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, BspError::QuorumNotMet { superstep: 3, .. }));
        let session = harness.session();
        assert!(!session
            .exists(&harness.paths().input_splits(), false)
            .await
            .unwrap());
    }
}
