//! Master coordinator
//!
//! Election, worker health, range assignment, the superstep barrier and the
//! job driver. Every piece shares one [`MasterContext`].

pub mod assignment;
pub mod balancer;
pub mod barrier;
pub mod driver;
pub mod job_state;
pub mod leader;
pub mod membership;
pub mod superstep;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointManager;
use crate::config::MasterConfig;
use crate::coordination::{CoordinationClient, CoordinationPaths, WatchedEvent};
use crate::events::{EventBus, MasterEvents};
use crate::runtime::ShutdownSignal;
use crate::storage::ObjectStore;

pub use assignment::{InputConfig, InputSplitSource};
pub use balancer::{Balancer, BalancerKind};
pub use barrier::{SuperstepCoordinator, SuperstepState};
pub use driver::{JobOutcome, MasterDriver};
pub use job_state::{JobKiller, JobState, JobStateLog, JobStateRecord, LoggingJobKiller};
pub use leader::LeaderElector;
pub use membership::{HealthConfig, WorkerHealthTracker};
pub use superstep::SuperstepTracker;

/// State shared by every master component
#[derive(Clone)]
pub struct MasterContext {
    pub config: Arc<MasterConfig>,
    pub client: Arc<dyn CoordinationClient>,
    pub storage: Arc<dyn ObjectStore>,
    pub paths: CoordinationPaths,
    pub events: Arc<MasterEvents>,
    pub tracker: SuperstepTracker,
    pub job_state: Arc<JobStateLog>,
    pub checkpoints: Arc<CheckpointManager>,
    pub balancer: Arc<dyn Balancer>,
    pub splits: Arc<dyn InputSplitSource>,
}

impl MasterContext {
    pub fn new(
        config: MasterConfig,
        client: Arc<dyn CoordinationClient>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        let paths = CoordinationPaths::new(&config.job_id);
        let job_state = Arc::new(JobStateLog::new(
            client.clone(),
            paths.clone(),
            Arc::new(LoggingJobKiller),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            storage.clone(),
            client.clone(),
            paths.clone(),
            config.checkpoint.clone(),
        ));
        let balancer = config.balancer.build();
        let splits: Arc<dyn InputSplitSource> = Arc::new(config.input.clone());
        Self {
            config: Arc::new(config),
            client,
            storage,
            paths,
            events: Arc::new(MasterEvents::new()),
            tracker: SuperstepTracker::new(),
            job_state,
            checkpoints,
            balancer,
            splits,
        }
    }

    /// Replace the hook invoked when the job fails
    pub fn with_killer(mut self, killer: Arc<dyn JobKiller>) -> Self {
        self.job_state = Arc::new(JobStateLog::new(
            self.client.clone(),
            self.paths.clone(),
            killer,
        ));
        self
    }

    pub fn with_split_source(mut self, splits: Arc<dyn InputSplitSource>) -> Self {
        self.splits = splits;
        self
    }

    pub fn with_balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = balancer;
        self
    }

    /// Route this session's watch notifications into [`MasterEvents`]
    pub fn spawn_event_bus(
        &self,
        receiver: mpsc::UnboundedReceiver<WatchedEvent>,
        shutdown: &ShutdownSignal,
    ) -> JoinHandle<()> {
        EventBus::new(self.paths.clone(), self.tracker.clone(), self.events.clone())
            .spawn(receiver, shutdown)
    }
}
