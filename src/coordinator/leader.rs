//! Master election
//!
//! Every candidate places an ephemeral sequential bid; the lowest sequence
//! is the master. A candidate whose bid is not first waits for the bid list
//! (or the job state) to change and checks again.

use tracing::{debug, info};

use super::job_state::JobState;
use super::MasterContext;
use crate::coordination::{self, CreateMode};
use crate::error::Result;

/// Runs the election for one candidate
pub struct LeaderElector<'a> {
    ctx: &'a MasterContext,
}

impl<'a> LeaderElector<'a> {
    pub fn new(ctx: &'a MasterContext) -> Self {
        Self { ctx }
    }

    /// Block until this candidate is master (`true`) or the job is finished (`false`)
    pub async fn become_master(&self) -> Result<bool> {
        let ctx = self.ctx;
        let election_dir = ctx.paths.master_election_dir();
        let bid_prefix = coordination::join(&election_dir, &format!("{}_", ctx.config.master_id()));
        let bid_path = ctx
            .client
            .create(&bid_prefix, Vec::new(), CreateMode::EphemeralSequential, true)
            .await?;
        let bid = bid_path
            .rsplit('/')
            .next()
            .unwrap_or(bid_path.as_str())
            .to_string();
        info!("become_master: placed bid {}", bid_path);

        loop {
            // Reset before reading so changes after the reads are not lost
            ctx.events.master_election_changed.reset();
            ctx.events.job_state_changed.reset();

            if let Some(record) = ctx.job_state.latest(true).await? {
                if record.state == JobState::Finished {
                    info!("become_master: job already finished, not becoming master");
                    return Ok(false);
                }
            }

            let mut bids =
                coordination::children_or_empty(ctx.client.as_ref(), &election_dir, true).await?;
            if !bids.contains(&bid) {
                // The job's state was removed by the cleanup of a finished master
                info!("become_master: bid {} is gone, job is over", bid);
                return Ok(false);
            }
            coordination::sort_by_sequence(&mut bids);
            match bids.first() {
                Some(first) if *first == bid => {
                    info!("become_master: {} is now the master", ctx.config.master_id());
                    return Ok(true);
                }
                first => debug!(
                    "become_master: waiting behind {:?} ({} bids)",
                    first,
                    bids.len()
                ),
            }

            tokio::select! {
                _ = ctx.events.master_election_changed.wait() => {}
                _ = ctx.events.job_state_changed.wait() => {}
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

    fn candidate_config(partition_id: u32) -> MasterConfig {
        MasterConfig {
            job_id: "elect".into(),
            hostname: "master".into(),
            partition_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_candidate_promoted_after_first_leaves() {
        let harness = Harness::new();
        let first = harness.master(candidate_config(0));
        let second = harness.master(candidate_config(1));

        assert!(LeaderElector::new(&first.ctx).become_master().await.unwrap());

        let second_ctx = second.ctx.clone();
        let pending =
            tokio::spawn(async move { LeaderElector::new(&second_ctx).become_master().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        first.session.close();
        let promoted = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(promoted);
    }

    #[tokio::test]
    async fn test_finished_job_elects_nobody() {
        let harness = Harness::new();
        let first = harness.master(candidate_config(0));
        first
            .ctx
            .job_state
            .publish(JobState::Finished, 0, 7)
            .await
            .unwrap();

        let late = harness.master(candidate_config(1));
        assert!(!LeaderElector::new(&late.ctx).become_master().await.unwrap());
    }

    #[tokio::test]
    async fn test_standby_sees_first_published_state() {
        let harness = Harness::new();
        let first = harness.master(candidate_config(0));
        let second = harness.master(candidate_config(1));
        assert!(LeaderElector::new(&first.ctx).become_master().await.unwrap());

        // The standby starts waiting before any job state exists
        let second_ctx = second.ctx.clone();
        let pending =
            tokio::spawn(async move { LeaderElector::new(&second_ctx).become_master().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        first
            .ctx
            .job_state
            .publish(JobState::Finished, 0, 4)
            .await
            .unwrap();
        let promoted = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!promoted);
    }

    #[tokio::test]
    async fn test_standby_steps_down_after_cleanup() {
        let harness = Harness::new();
        let first = harness.master(candidate_config(0));
        let second = harness.master(candidate_config(1));
        assert!(LeaderElector::new(&first.ctx).become_master().await.unwrap());

        let second_ctx = second.ctx.clone();
        let pending =
            tokio::spawn(async move { LeaderElector::new(&second_ctx).become_master().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        // Cleanup removes the election directory along with the bids
        first
            .session
            .delete(harness.paths().base(), true)
            .await
            .unwrap();
        let promoted = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!promoted);
    }
}
