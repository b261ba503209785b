//! In-process cluster
//!
//! Simulated workers sharing one in-memory ensemble and object store with a
//! master, for the demo binary and end-to-end tests.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::MasterConfig;
use crate::coordination::{MemoryEnsemble, MemorySession};
use crate::error::{BspError, Result};
use crate::storage::ObjectStore;

pub use worker::{LocalWorker, LocalWorkerSettings, WorkerExit, WorkerPhase, WorkerState};

impl LocalWorkerSettings {
    /// Settings for worker `partition_id` of the job `config` describes
    pub fn for_job(config: &MasterConfig, partition_id: u32, halt_after: u64) -> Self {
        Self {
            job_id: config.job_id.clone(),
            hostname: "worker".into(),
            partition_id,
            port: 9000 + partition_id as u16,
            halt_after,
            poll_period: Duration::from_millis(5),
            checkpoint: config.checkpoint.clone(),
            restart_superstep: config.restart_superstep,
            crash_at: None,
        }
    }
}

struct RunningWorker {
    partition_id: u32,
    session: Arc<MemorySession>,
    state: Arc<WorkerState>,
    handle: JoinHandle<Result<WorkerExit>>,
}

/// A set of running simulated workers
pub struct LocalCluster {
    workers: Vec<RunningWorker>,
}

impl LocalCluster {
    /// Start one worker per settings entry, each on its own session
    pub fn start(
        ensemble: &MemoryEnsemble,
        storage: Arc<dyn ObjectStore>,
        settings: Vec<LocalWorkerSettings>,
    ) -> Self {
        let workers = settings
            .into_iter()
            .map(|settings| {
                let partition_id = settings.partition_id;
                // Workers poll, so their watch events are dropped
                let (session, _events) = ensemble.connect();
                let session = Arc::new(session);
                let worker = LocalWorker::new(settings, session.clone(), storage.clone());
                let state = worker.state();
                let handle = tokio::spawn(async move { worker.run().await });
                RunningWorker {
                    partition_id,
                    session,
                    state,
                    handle,
                }
            })
            .collect::<Vec<_>>();
        info!("Started {} local workers", workers.len());
        Self { workers }
    }

    /// Start `count` identical workers for a job
    pub fn for_job(
        ensemble: &MemoryEnsemble,
        storage: Arc<dyn ObjectStore>,
        config: &MasterConfig,
        count: u32,
        halt_after: u64,
    ) -> Self {
        let settings = (0..count)
            .map(|p| LocalWorkerSettings::for_job(config, p, halt_after))
            .collect();
        Self::start(ensemble, storage, settings)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Progress of worker `partition_id`
    pub fn state(&self, partition_id: u32) -> Option<Arc<WorkerState>> {
        self.workers
            .iter()
            .find(|w| w.partition_id == partition_id)
            .map(|w| w.state.clone())
    }

    /// Drop a worker's session as if its process died
    pub fn kill(&self, partition_id: u32) -> bool {
        match self.workers.iter().find(|w| w.partition_id == partition_id) {
            Some(worker) => {
                info!("Killing local worker {}", partition_id);
                worker.session.close();
                worker.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Wait for every worker; killed workers report `Internal`
    pub async fn join(self) -> Vec<Result<WorkerExit>> {
        let mut exits = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            exits.push(match worker.handle.await {
                Ok(exit) => exit,
                Err(e) => Err(BspError::Internal {
                    message: format!("worker {} stopped: {}", worker.partition_id, e),
                }),
            });
        }
        exits
    }
}
