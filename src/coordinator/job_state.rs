//! Job state log
//!
//! Job states are appended as sequential nodes; the entry with the highest
//! sequence number is the current state. Publishing `Failed` also invokes
//! the job-kill hook.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::coordination::{self, CoordinationClient, CoordinationPaths, CreateMode};
use crate::error::Result;

/// Lifecycle state of the whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Setup,
    InputSuperstep,
    StartSuperstep,
    Waiting,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

/// One entry of the job state log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub state: JobState,
    pub application_attempt: u64,
    pub superstep: u64,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
}

/// Hook invoked when the job enters `Failed`
#[async_trait]
pub trait JobKiller: Send + Sync {
    async fn kill_job(&self, record: &JobStateRecord) -> Result<()>;
}

/// Kill hook that only logs; process launch is owned elsewhere
pub struct LoggingJobKiller;

#[async_trait]
impl JobKiller for LoggingJobKiller {
    async fn kill_job(&self, record: &JobStateRecord) -> Result<()> {
        error!(
            "kill_job: job failed on superstep {} (attempt {}), killing all tasks",
            record.superstep, record.application_attempt
        );
        Ok(())
    }
}

/// Reader and writer of the job state log
pub struct JobStateLog {
    client: Arc<dyn CoordinationClient>,
    paths: CoordinationPaths,
    killer: Arc<dyn JobKiller>,
}

impl JobStateLog {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        paths: CoordinationPaths,
        killer: Arc<dyn JobKiller>,
    ) -> Self {
        Self {
            client,
            paths,
            killer,
        }
    }

    /// Append a new state entry
    pub async fn publish(&self, state: JobState, application_attempt: u64, superstep: u64) -> Result<()> {
        let record = JobStateRecord {
            state,
            application_attempt,
            superstep,
            published_at: Utc::now(),
        };
        let prefix = self.paths.job_state_entry();
        let data = coordination::encode_json(&prefix, &record)?;
        let path = self
            .client
            .create(&prefix, data, CreateMode::PersistentSequential, true)
            .await?;
        info!(
            "publish: job state {:?} (attempt {}, superstep {}) at {}",
            state, application_attempt, superstep, path
        );

        if state == JobState::Failed {
            self.killer.kill_job(&record).await?;
        }
        Ok(())
    }

    /// Most recent entry, optionally arming a watch for the next one
    pub async fn latest(&self, watch: bool) -> Result<Option<JobStateRecord>> {
        let dir = self.paths.job_state_dir();
        let mut entries = coordination::children_or_empty(self.client.as_ref(), &dir, watch).await?;
        if watch && entries.is_empty() {
            // Watch the directory's creation instead
            self.client.exists(&dir, true).await?;
        }
        coordination::sort_by_sequence(&mut entries);
        match entries.last() {
            Some(name) => {
                let path = coordination::join(&dir, name);
                let record: JobStateRecord = coordination::read_json(self.client.as_ref(), &path).await?;
                debug!("latest: {:?} from {}", record.state, path);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingKiller(AtomicUsize);

    #[async_trait]
    impl JobKiller for CountingKiller {
        async fn kill_job(&self, _record: &JobStateRecord) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_latest_entry_wins() {
        let ensemble = MemoryEnsemble::new();
        let (session, _events) = ensemble.connect();
        let killer = Arc::new(CountingKiller(AtomicUsize::new(0)));
        let log = JobStateLog::new(Arc::new(session), CoordinationPaths::new("j"), killer.clone());

        assert_eq!(log.latest(false).await.unwrap(), None);
        for (state, superstep) in (0..11).map(|s| (JobState::StartSuperstep, s)) {
            log.publish(state, 0, superstep).await.unwrap();
        }
        let latest = log.latest(false).await.unwrap().unwrap();
        assert_eq!(latest.superstep, 10);
        assert_eq!(killer.0.load(Ordering::SeqCst), 0);

        log.publish(JobState::Failed, 0, 10).await.unwrap();
        assert_eq!(log.latest(false).await.unwrap().unwrap().state, JobState::Failed);
        assert_eq!(killer.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_record_without_timestamp() {
        let record: JobStateRecord =
            serde_json::from_str(r#"{"state":"WAITING","application_attempt":1,"superstep":4}"#)
                .unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.superstep, 4);
    }

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&JobState::InputSuperstep).unwrap();
        assert_eq!(json, "\"INPUT_SUPERSTEP\"");
        assert!(JobState::Finished.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
    }
}
