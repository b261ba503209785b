//! Worker health tracking
//!
//! Workers announce themselves for every superstep by creating a node under
//! the superstep's healthy or unhealthy directory. The master polls those
//! directories until enough workers have responded.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::MasterContext;
use crate::coordination::records::HealthRegistration;
use crate::coordination::{self, CreateMode};
use crate::error::{BspError, Result};
use crate::graph::{self, WorkerInfo, WorkerMap};
use crate::metrics::standard;

/// Configuration for health checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Workers the job was launched with
    pub max_workers: usize,
    /// Healthy workers required to run a superstep
    pub min_workers: usize,
    /// Share of `max_workers` (in percent) that must respond before deciding
    pub min_percent_responded: f32,
    /// How long to wait between polls
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,
    /// Polls without a registration change before giving up
    pub max_poll_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            min_workers: 1,
            min_percent_responded: 100.0,
            poll_period: Duration::from_secs(3),
            max_poll_attempts: 20,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        let reason = if self.max_workers == 0 {
            "max_workers must be at least 1".to_string()
        } else if self.min_workers > self.max_workers {
            format!(
                "min_workers {} exceeds max_workers {}",
                self.min_workers, self.max_workers
            )
        } else if !(self.min_percent_responded > 0.0 && self.min_percent_responded <= 100.0) {
            format!(
                "min_percent_responded {} is outside (0, 100]",
                self.min_percent_responded
            )
        } else if self.max_poll_attempts == 0 {
            "max_poll_attempts must be at least 1".to_string()
        } else {
            return Ok(());
        };
        Err(BspError::InvalidConfig { reason })
    }

    /// True once `responses` workers out of `max_workers` is enough to decide
    pub fn quorum_met(&self, responses: usize) -> bool {
        responses as f32 * 100.0 / self.max_workers as f32 >= self.min_percent_responded
    }
}

/// Decides which workers take part in a superstep
pub struct WorkerHealthTracker<'a> {
    ctx: &'a MasterContext,
}

impl<'a> WorkerHealthTracker<'a> {
    pub fn new(ctx: &'a MasterContext) -> Self {
        Self { ctx }
    }

    async fn list(&self, attempt: u64, superstep: u64) -> Result<(Vec<String>, Vec<String>)> {
        let client = self.ctx.client.as_ref();
        let healthy = coordination::children_or_empty(
            client,
            &self.ctx.paths.worker_healthy_dir(attempt, superstep),
            true,
        )
        .await?;
        let unhealthy = coordination::children_or_empty(
            client,
            &self.ctx.paths.worker_unhealthy_dir(attempt, superstep),
            true,
        )
        .await?;
        Ok((healthy, unhealthy))
    }

    /// Wait for enough workers to report for `(attempt, superstep)`.
    ///
    /// Returns the healthy workers keyed by id, or `None` when the quorum was
    /// not reached within the poll budget or too few workers are healthy.
    pub async fn check_workers(&self, attempt: u64, superstep: u64) -> Result<Option<WorkerMap>> {
        let ctx = self.ctx;
        let health = &ctx.config.health;
        let client = ctx.client.as_ref();
        for dir in [
            ctx.paths.worker_healthy_dir(attempt, superstep),
            ctx.paths.worker_unhealthy_dir(attempt, superstep),
        ] {
            coordination::create_if_absent(client, &dir, Vec::new(), CreateMode::Persistent).await?;
        }

        let changed = &ctx.events.worker_health_registration_changed;
        let mut poll_attempt = 0;
        let mut responded = None;
        while poll_attempt < health.max_poll_attempts {
            changed.reset();
            let (healthy, unhealthy) = self.list(attempt, superstep).await?;
            let responses = healthy.len() + unhealthy.len();
            if health.quorum_met(responses) {
                responded = Some((healthy, unhealthy));
                break;
            }
            info!(
                "check_workers: only found {} responses of {} for superstep {}, \
                 sleeping for {:?} and used {} of {} attempts",
                responses, health.max_workers, superstep, health.poll_period, poll_attempt,
                health.max_poll_attempts
            );
            if changed.wait_timeout(health.poll_period).await {
                info!("check_workers: health registration changed, not using poll attempt");
                continue;
            }
            poll_attempt += 1;
        }

        let (healthy, unhealthy) = match responded {
            Some(lists) => lists,
            None => {
                warn!(
                    "check_workers: did not receive enough responses in time for superstep {}",
                    superstep
                );
                return Ok(None);
            }
        };
        if !unhealthy.is_empty() {
            warn!(
                "check_workers: {} unhealthy workers on superstep {}: {:?}",
                unhealthy.len(),
                superstep,
                unhealthy
            );
        }
        if healthy.len() < health.min_workers {
            warn!(
                "check_workers: only {} available when {} are required",
                healthy.len(),
                health.min_workers
            );
            return Ok(None);
        }

        let healthy_dir = ctx.paths.worker_healthy_dir(attempt, superstep);
        let mut workers = WorkerMap::new();
        for worker_id in &healthy {
            let path = coordination::join(&healthy_dir, worker_id);
            let registration: HealthRegistration = match client.get_data(&path, false).await {
                Ok(data) => coordination::decode_json(&path, &data)?,
                Err(BspError::NoNode { .. }) => {
                    warn!("check_workers: {} left before it could be read", worker_id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let partition_id = graph::parse_worker_id(worker_id)
                .map(|(_, partition)| partition)
                .ok_or_else(|| BspError::MalformedRecord {
                    path: path.clone(),
                    reason: format!("worker id '{}' has no partition suffix", worker_id),
                })?;
            let info = WorkerInfo::new(registration.hostname(), registration.port(), partition_id);
            debug!("check_workers: {} at {}:{}", worker_id, info.hostname, info.port);
            workers.insert(worker_id.clone(), info);
        }

        if workers.len() < health.min_workers {
            warn!(
                "check_workers: only {} readable healthy workers when {} are required",
                workers.len(),
                health.min_workers
            );
            return Ok(None);
        }
        standard::ACTIVE_WORKERS.set(workers.len() as i64);
        Ok(Some(workers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::coordinator::test_support::Harness;

    fn config(max: usize, min: usize, percent: f32, attempts: u32) -> MasterConfig {
        MasterConfig {
            job_id: "health".into(),
            health: HealthConfig {
                max_workers: max,
                min_workers: min,
                min_percent_responded: percent,
                poll_period: Duration::from_millis(20),
                max_poll_attempts: attempts,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_quorum_threshold() {
        let health = config(4, 3, 75.0, 1).health;
        assert!(!health.quorum_met(2));
        assert!(health.quorum_met(3));
        assert!(health.quorum_met(4));
    }

    #[tokio::test]
    async fn test_quorum_with_unhealthy_worker() {
        let harness = Harness::new();
        let master = harness.master(config(4, 3, 75.0, 3));
        for p in 0..3 {
            harness.register_healthy(0, 0, "node", p).await;
        }
        harness.register_unhealthy(0, 0, "node", 3).await;

        let workers = WorkerHealthTracker::new(&master.ctx)
            .check_workers(0, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workers.len(), 3);
        let first = &workers["node_0"];
        assert_eq!((first.hostname.as_str(), first.port, first.partition_id), ("node", 9000, 0));
    }

    #[tokio::test]
    async fn test_no_quorum_after_attempts() {
        let harness = Harness::new();
        let master = harness.master(config(4, 1, 75.0, 2));
        harness.register_healthy(0, 0, "node", 0).await;

        let result = WorkerHealthTracker::new(&master.ctx).check_workers(0, 0).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_too_few_healthy() {
        let harness = Harness::new();
        let master = harness.master(config(4, 3, 50.0, 2));
        harness.register_healthy(0, 0, "node", 0).await;
        harness.register_healthy(0, 0, "node", 1).await;
        harness.register_unhealthy(0, 0, "node", 2).await;

        let result = WorkerHealthTracker::new(&master.ctx).check_workers(0, 0).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_late_registration_does_not_use_attempt() {
        let harness = Harness::new();
        let master = harness.master(config(2, 2, 100.0, 1));
        harness.register_healthy(0, 0, "node", 0).await;

        let late = {
            let harness = harness.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                harness.register_healthy(0, 0, "node", 1).await;
            })
        };
        let result = WorkerHealthTracker::new(&master.ctx).check_workers(0, 0).await.unwrap();
        late.await.unwrap();
        assert_eq!(result.map(|w| w.len()), Some(2));
    }
}
