//! Coordination path layout
//!
//! Every per-superstep node lives under
//! `{base}/attempts/{attempt}/supersteps/{superstep}` so a single recursive
//! delete removes all transient state of one superstep, and nothing from a
//! stale application attempt is ever observed by a fresh one.

use super::join;

const JOB_STATE_DIR: &str = "job-state";
const JOB_STATE_NODE: &str = "jobState";
const MASTER_ELECTION_DIR: &str = "master-election";
const INPUT_SPLITS_DIR: &str = "input-splits";
const INPUT_SPLITS_ALL_READY: &str = "input-splits-all-ready";
const INPUT_SPLIT_FINISHED: &str = "finished";
const ATTEMPTS_DIR: &str = "attempts";
const SUPERSTEPS_DIR: &str = "supersteps";
const WORKER_HEALTHY_DIR: &str = "worker-healthy";
const WORKER_UNHEALTHY_DIR: &str = "worker-unhealthy";
const WORKER_FINISHED_DIR: &str = "worker-finished";
const VERTEX_RANGE_ASSIGNMENTS: &str = "vertex-range-assignments";
const VERTEX_RANGE_EXCHANGE_DIR: &str = "vertex-range-exchange";
const VERTEX_RANGE_EXCHANGE_FINISHED: &str = "vertex-range-exchange-finished";
const SUPERSTEP_FINISHED: &str = "superstep-finished";
const MERGED_AGGREGATORS: &str = "merged-aggregators";
const CLEANED_UP_DIR: &str = "cleaned-up";

/// What a watched path refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    JobState,
    MasterElection,
    CleanedUp,
    WorkerHealthyDir { attempt: u64, superstep: u64 },
    WorkerHealthy { attempt: u64, superstep: u64, worker_id: String },
    WorkerUnhealthyDir { attempt: u64, superstep: u64 },
    WorkerFinishedDir { attempt: u64, superstep: u64 },
    VertexRangeExchangeDir { attempt: u64, superstep: u64 },
    Other,
}

/// Path builder for one job
#[derive(Debug, Clone)]
pub struct CoordinationPaths {
    base: String,
}

impl CoordinationPaths {
    pub fn new(job_id: &str) -> Self {
        Self {
            base: format!("/_bsp/{}", job_id),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn job_state_dir(&self) -> String {
        join(&self.base, JOB_STATE_DIR)
    }

    /// Prefix for sequential job-state log entries
    pub fn job_state_entry(&self) -> String {
        join(&self.job_state_dir(), JOB_STATE_NODE)
    }

    pub fn master_election_dir(&self) -> String {
        join(&self.base, MASTER_ELECTION_DIR)
    }

    pub fn input_splits(&self) -> String {
        join(&self.base, INPUT_SPLITS_DIR)
    }

    pub fn input_split(&self, index: usize) -> String {
        join(&self.input_splits(), &index.to_string())
    }

    pub fn input_split_finished(&self, index: usize) -> String {
        join(&self.input_split(index), INPUT_SPLIT_FINISHED)
    }

    /// Finished node below an input split child name
    pub fn input_split_finished_of(&self, split_name: &str) -> String {
        join(&join(&self.input_splits(), split_name), INPUT_SPLIT_FINISHED)
    }

    pub fn input_splits_all_ready(&self) -> String {
        join(&self.base, INPUT_SPLITS_ALL_READY)
    }

    pub fn attempt(&self, attempt: u64) -> String {
        join(&join(&self.base, ATTEMPTS_DIR), &attempt.to_string())
    }

    pub fn supersteps(&self, attempt: u64) -> String {
        join(&self.attempt(attempt), SUPERSTEPS_DIR)
    }

    pub fn superstep(&self, attempt: u64, superstep: u64) -> String {
        join(&self.supersteps(attempt), &superstep.to_string())
    }

    pub fn worker_healthy_dir(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), WORKER_HEALTHY_DIR)
    }

    pub fn worker_healthy(&self, attempt: u64, superstep: u64, worker_id: &str) -> String {
        join(&self.worker_healthy_dir(attempt, superstep), worker_id)
    }

    pub fn worker_unhealthy_dir(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), WORKER_UNHEALTHY_DIR)
    }

    pub fn worker_unhealthy(&self, attempt: u64, superstep: u64, worker_id: &str) -> String {
        join(&self.worker_unhealthy_dir(attempt, superstep), worker_id)
    }

    pub fn worker_finished_dir(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), WORKER_FINISHED_DIR)
    }

    pub fn worker_finished(&self, attempt: u64, superstep: u64, worker_id: &str) -> String {
        join(&self.worker_finished_dir(attempt, superstep), worker_id)
    }

    pub fn vertex_range_assignments(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), VERTEX_RANGE_ASSIGNMENTS)
    }

    pub fn vertex_range_exchange_dir(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), VERTEX_RANGE_EXCHANGE_DIR)
    }

    pub fn vertex_range_exchange_finished(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), VERTEX_RANGE_EXCHANGE_FINISHED)
    }

    pub fn superstep_finished(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), SUPERSTEP_FINISHED)
    }

    pub fn merged_aggregators(&self, attempt: u64, superstep: u64) -> String {
        join(&self.superstep(attempt, superstep), MERGED_AGGREGATORS)
    }

    pub fn cleaned_up_dir(&self) -> String {
        join(&self.base, CLEANED_UP_DIR)
    }

    /// Classify a watched path
    pub fn classify(&self, path: &str) -> PathKind {
        let rest = match path.strip_prefix(&self.base) {
            Some(rest) => rest.trim_start_matches('/'),
            None => return PathKind::Other,
        };
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [JOB_STATE_DIR] => PathKind::JobState,
            [MASTER_ELECTION_DIR] => PathKind::MasterElection,
            [CLEANED_UP_DIR] => PathKind::CleanedUp,
            [ATTEMPTS_DIR, attempt, SUPERSTEPS_DIR, superstep, tail @ ..] => {
                let (attempt, superstep) = match (attempt.parse(), superstep.parse()) {
                    (Ok(a), Ok(s)) => (a, s),
                    _ => return PathKind::Other,
                };
                match tail {
                    [WORKER_HEALTHY_DIR] => PathKind::WorkerHealthyDir { attempt, superstep },
                    [WORKER_HEALTHY_DIR, worker_id] => PathKind::WorkerHealthy {
                        attempt,
                        superstep,
                        worker_id: worker_id.to_string(),
                    },
                    [WORKER_UNHEALTHY_DIR] => PathKind::WorkerUnhealthyDir { attempt, superstep },
                    [WORKER_FINISHED_DIR] => PathKind::WorkerFinishedDir { attempt, superstep },
                    [VERTEX_RANGE_EXCHANGE_DIR] => {
                        PathKind::VertexRangeExchangeDir { attempt, superstep }
                    }
                    _ => PathKind::Other,
                }
            }
            _ => PathKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superstep_namespacing() {
        let paths = CoordinationPaths::new("job-1");
        assert_eq!(
            paths.worker_healthy(2, 7, "host_3"),
            "/_bsp/job-1/attempts/2/supersteps/7/worker-healthy/host_3"
        );
        assert!(paths
            .merged_aggregators(2, 7)
            .starts_with(&paths.superstep(2, 7)));
        assert_eq!(paths.input_split_finished(4), "/_bsp/job-1/input-splits/4/finished");
    }

    #[test]
    fn test_classify() {
        let paths = CoordinationPaths::new("job-1");
        assert_eq!(
            paths.classify(&paths.worker_healthy(0, 5, "h_1")),
            PathKind::WorkerHealthy {
                attempt: 0,
                superstep: 5,
                worker_id: "h_1".into()
            }
        );
        assert_eq!(
            paths.classify(&paths.worker_finished_dir(1, 2)),
            PathKind::WorkerFinishedDir { attempt: 1, superstep: 2 }
        );
        assert_eq!(paths.classify(&paths.master_election_dir()), PathKind::MasterElection);
        assert_eq!(paths.classify("/_bsp/other-job/job-state"), PathKind::Other);
    }
}
