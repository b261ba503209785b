//! Simulated worker
//!
//! Follows the worker side of the coordination protocol against a
//! [`MemoryEnsemble`](crate::coordination::MemoryEnsemble) session: register
//! health, load splits or read assignments, acknowledge moved ranges, report
//! results, write checkpoint metadata and leave a cleaned-up marker.
//! Vertices halt on a fixed schedule instead of running a compute kernel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorEntry, AggregatorKind, AggregatorValue};
use crate::checkpoint::{CheckpointConfig, CheckpointManager, CheckpointMetadata, MetadataEntry};
use crate::coordination::records::{HealthRegistration, InputSplitRecord, WorkerFinishedReport};
use crate::coordination::{self, CoordinationClient, CoordinationPaths, CreateMode, MemorySession};
use crate::coordinator::job_state::{JobState, JobStateLog, LoggingJobKiller};
use crate::error::{ignore_transient, Result};
use crate::graph::{self, VertexRangeStat, VertexRangeTable, WorkerId};
use crate::storage::ObjectStore;

/// Settings of one simulated worker
#[derive(Debug, Clone)]
pub struct LocalWorkerSettings {
    pub job_id: String,
    pub hostname: String,
    pub partition_id: u32,
    pub port: u16,
    /// Superstep at which every vertex has voted to halt
    pub halt_after: u64,
    pub poll_period: Duration,
    pub checkpoint: CheckpointConfig,
    /// Start from this superstep, matching the master's restart point
    pub restart_superstep: Option<u64>,
    /// Drop the session on reaching this superstep of the first attempt
    pub crash_at: Option<u64>,
}

impl LocalWorkerSettings {
    pub fn id(&self) -> WorkerId {
        graph::worker_id(&self.hostname, self.partition_id)
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Registered,
    Loading,
    Exchanging,
    Computing,
    Waiting,
    CleaningUp,
    Done,
}

/// How a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The job finished; `superstep` is the last one this worker saw
    Finished { superstep: u64 },
    JobFailed,
    Crashed { superstep: u64 },
}

/// Observable worker progress
pub struct WorkerState {
    phase: Mutex<WorkerPhase>,
    attempt: AtomicU64,
    superstep: AtomicU64,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            phase: Mutex::new(WorkerPhase::Registered),
            attempt: AtomicU64::new(0),
            superstep: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: WorkerPhase) {
        *self.phase.lock() = phase;
    }

    pub fn attempt(&self) -> u64 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub fn superstep(&self) -> u64 {
        self.superstep.load(Ordering::Relaxed)
    }

    fn set_position(&self, position: Position) {
        self.attempt.store(position.attempt, Ordering::Relaxed);
        self.superstep.store(position.superstep, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    attempt: u64,
    superstep: u64,
    restarting: bool,
}

/// Result of waiting for a node
enum Wait {
    Ready,
    Restart(Position),
    JobFinished,
    JobFailed,
}

/// Result of one superstep
enum Step {
    Next,
    Restart(Position),
    JobFinished,
    JobFailed,
}

impl Wait {
    /// The step to take instead of continuing, if any
    fn interrupted(self) -> Option<Step> {
        match self {
            Wait::Ready => None,
            Wait::Restart(position) => Some(Step::Restart(position)),
            Wait::JobFinished => Some(Step::JobFinished),
            Wait::JobFailed => Some(Step::JobFailed),
        }
    }
}

/// One simulated worker
pub struct LocalWorker {
    settings: LocalWorkerSettings,
    id: WorkerId,
    session: Arc<MemorySession>,
    paths: CoordinationPaths,
    job_state: JobStateLog,
    checkpoints: CheckpointManager,
    state: Arc<WorkerState>,
}

impl LocalWorker {
    pub fn new(
        settings: LocalWorkerSettings,
        session: Arc<MemorySession>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        let paths = CoordinationPaths::new(&settings.job_id);
        let client: Arc<dyn CoordinationClient> = session.clone();
        let job_state = JobStateLog::new(client.clone(), paths.clone(), Arc::new(LoggingJobKiller));
        let checkpoints =
            CheckpointManager::new(storage, client, paths.clone(), settings.checkpoint.clone());
        Self {
            id: settings.id(),
            settings,
            session,
            paths,
            job_state,
            checkpoints,
            state: Arc::new(WorkerState::new()),
        }
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    fn client(&self) -> &dyn CoordinationClient {
        self.session.as_ref()
    }

    /// Finished vertices of a range after computing `superstep`
    fn finished_at(&self, vertex_count: u64, superstep: u64) -> u64 {
        if superstep >= self.settings.halt_after {
            vertex_count
        } else {
            vertex_count * superstep / self.settings.halt_after.max(1)
        }
    }

    /// Announce this worker for a superstep
    pub async fn register(&self, attempt: u64, superstep: u64) -> Result<()> {
        let path = self.paths.worker_healthy(attempt, superstep, &self.id);
        let registration = HealthRegistration(self.settings.hostname.clone(), self.settings.port);
        let data = coordination::encode_json(&path, &registration)?;
        if ignore_transient(
            "register",
            self.client()
                .create(&path, data, CreateMode::Ephemeral, true)
                .await,
        )?
        .is_some()
        {
            debug!("register: {} at {}", self.id, path);
        }
        Ok(())
    }

    /// Poll until `path` exists, giving way to job-state changes
    async fn wait_for(&self, path: &str, position: Position) -> Result<Wait> {
        loop {
            if self.client().exists(path, false).await? {
                return Ok(Wait::Ready);
            }
            if let Some(record) = self.job_state.latest(false).await? {
                match record.state {
                    JobState::Failed => return Ok(Wait::JobFailed),
                    JobState::Finished => return Ok(Wait::JobFinished),
                    _ if record.application_attempt > position.attempt => {
                        return Ok(Wait::Restart(Position {
                            attempt: record.application_attempt,
                            superstep: record.superstep,
                            restarting: true,
                        }))
                    }
                    _ => {}
                }
            }
            tokio::time::sleep(self.settings.poll_period).await;
        }
    }

    /// Run until the job ends or this worker crashes
    pub async fn run(&self) -> Result<WorkerExit> {
        let mut position = Position {
            attempt: 0,
            superstep: self.settings.restart_superstep.unwrap_or(0),
            restarting: self.settings.restart_superstep.is_some(),
        };
        self.register(position.attempt, position.superstep).await?;

        loop {
            self.state.set_position(position);
            if position.attempt == 0 && self.settings.crash_at == Some(position.superstep) {
                warn!("run: {} crashing on superstep {}", self.id, position.superstep);
                self.session.close();
                return Ok(WorkerExit::Crashed {
                    superstep: position.superstep,
                });
            }

            match self.run_superstep(position).await? {
                Step::Next => {
                    position = Position {
                        attempt: position.attempt,
                        superstep: position.superstep + 1,
                        restarting: false,
                    };
                }
                Step::Restart(next) => {
                    info!(
                        "run: {} restarting at superstep {} on attempt {}",
                        self.id, next.superstep, next.attempt
                    );
                    self.register(next.attempt, next.superstep).await?;
                    position = next;
                }
                Step::JobFinished => {
                    self.cleanup().await?;
                    return Ok(WorkerExit::Finished {
                        superstep: position.superstep,
                    });
                }
                Step::JobFailed => {
                    warn!("run: job failed, {} stopping", self.id);
                    self.state.set_phase(WorkerPhase::Done);
                    self.session.close();
                    return Ok(WorkerExit::JobFailed);
                }
            }
        }
    }

    async fn run_superstep(&self, position: Position) -> Result<Step> {
        let Position {
            attempt, superstep, ..
        } = position;
        let mut ranges = if superstep == 0 && !position.restarting {
            self.state.set_phase(WorkerPhase::Loading);
            let ready = self.paths.input_splits_all_ready();
            if let Some(step) = self.wait_for(&ready, position).await?.interrupted() {
                return Ok(step);
            }
            self.load_splits().await?
        } else {
            self.state.set_phase(WorkerPhase::Exchanging);
            let exchanged = self.paths.vertex_range_exchange_finished(attempt, superstep);
            // Acks are due before the exchange can finish
            let assignments = self.paths.vertex_range_assignments(attempt, superstep);
            if let Some(step) = self.wait_for(&assignments, position).await?.interrupted() {
                return Ok(step);
            }
            let table = self.acknowledge_moves(attempt, superstep).await?;
            if let Some(step) = self.wait_for(&exchanged, position).await?.interrupted() {
                return Ok(step);
            }
            self.owned_ranges(&table)
        };

        self.state.set_phase(WorkerPhase::Computing);
        for range in ranges.iter_mut() {
            range.finished_vertex_count = self.finished_at(range.vertex_count, superstep);
        }
        if self.checkpoints.checkpoint_frequency_met(superstep) {
            self.write_checkpoint(superstep, &ranges).await?;
        }
        // Announce for the next superstep before the barrier can release it
        self.register(attempt, superstep + 1).await?;
        self.report(attempt, superstep, ranges).await?;
        self.state.set_phase(WorkerPhase::Waiting);
        let finished = self.paths.superstep_finished(attempt, superstep);
        Ok(self
            .wait_for(&finished, position)
            .await?
            .interrupted()
            .unwrap_or(Step::Next))
    }

    /// Load the splits dealt to this worker and report their ranges
    async fn load_splits(&self) -> Result<Vec<VertexRangeStat>> {
        let root = self.paths.input_splits();
        let mut ranges = Vec::new();
        for name in coordination::children_or_empty(self.client(), &root, false).await? {
            let index: usize = match name.parse() {
                Ok(index) => index,
                Err(_) => continue,
            };
            let path = self.paths.input_split(index);
            let record: InputSplitRecord = coordination::read_json(self.client(), &path).await?;
            if record.assigned_worker != self.id {
                continue;
            }
            let split = record.descriptor;
            let vertex_count = split.last_vertex_id - split.first_vertex_id + 1;
            let stat = VertexRangeStat {
                max_vertex_id: split.last_vertex_id,
                vertex_count,
                edge_count: vertex_count * 2,
                finished_vertex_count: 0,
                hostname_id: Some(self.id.clone()),
                checkpoint_file_prefix: None,
            };
            let finished = self.paths.input_split_finished(index);
            let body = coordination::encode_json(&finished, &vec![stat.clone()])?;
            coordination::create_or_set(self.client(), &finished, body).await?;
            debug!("load_splits: {} loaded split {}", self.id, index);
            ranges.push(stat);
        }
        Ok(ranges)
    }

    /// Acknowledge every moved range this worker now owns
    async fn acknowledge_moves(&self, attempt: u64, superstep: u64) -> Result<VertexRangeTable> {
        let path = self.paths.vertex_range_assignments(attempt, superstep);
        let data = self.client().get_data(&path, false).await?;
        let table = VertexRangeTable::from_json(&path, &data)?;
        let dir = self.paths.vertex_range_exchange_dir(attempt, superstep);
        for range in table.iter() {
            if range.owner.hostname_id != self.id || range.previous_owner.is_none() {
                continue;
            }
            let ack = coordination::join(&dir, &range.max_vertex_id.to_string());
            ignore_transient(
                "acknowledge_moves",
                self.client()
                    .create(&ack, Vec::new(), CreateMode::Persistent, true)
                    .await,
            )?;
            debug!("acknowledge_moves: {} received range {}", self.id, range.max_vertex_id);
        }
        Ok(table)
    }

    fn owned_ranges(&self, table: &VertexRangeTable) -> Vec<VertexRangeStat> {
        table
            .iter()
            .filter(|range| range.owner.hostname_id == self.id)
            .map(|range| VertexRangeStat {
                max_vertex_id: range.max_vertex_id,
                vertex_count: range.vertex_count,
                edge_count: range.edge_count,
                finished_vertex_count: 0,
                hostname_id: Some(self.id.clone()),
                checkpoint_file_prefix: None,
            })
            .collect()
    }

    async fn write_checkpoint(&self, superstep: u64, ranges: &[VertexRangeStat]) -> Result<()> {
        let prefix = self.settings.checkpoint.file_prefix(superstep, &self.id);
        let metadata = CheckpointMetadata {
            entries: ranges
                .iter()
                .enumerate()
                .map(|(position, range)| MetadataEntry {
                    file_position: position as i64,
                    vertex_count: range.vertex_count as i64,
                    edge_count: range.edge_count as i64,
                    max_vertex_id: range.max_vertex_id,
                })
                .collect(),
        };
        self.checkpoints.write_metadata(&prefix, &metadata).await?;
        debug!("write_checkpoint: {} wrote {}", self.id, prefix);
        Ok(())
    }

    async fn report(&self, attempt: u64, superstep: u64, ranges: Vec<VertexRangeStat>) -> Result<()> {
        let active: u64 = ranges
            .iter()
            .map(|r| r.vertex_count - r.finished_vertex_count)
            .sum();
        let report = WorkerFinishedReport {
            vertex_range_stats: ranges,
            aggregators: vec![
                AggregatorEntry::new(
                    "active_vertices",
                    AggregatorKind::LongSum,
                    AggregatorValue::Long(active as i64),
                ),
                AggregatorEntry::new(
                    "all_halted",
                    AggregatorKind::BooleanAnd,
                    AggregatorValue::Boolean(active == 0),
                ),
            ],
        };
        let path = self.paths.worker_finished(attempt, superstep, &self.id);
        let data = coordination::encode_json(&path, &report)?;
        ignore_transient(
            "report",
            self.client()
                .create(&path, data, CreateMode::Persistent, true)
                .await,
        )?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.state.set_phase(WorkerPhase::CleaningUp);
        let marker = coordination::join(
            &self.paths.cleaned_up_dir(),
            &format!("{}_worker", self.settings.partition_id),
        );
        coordination::create_if_absent(self.client(), &marker, Vec::new(), CreateMode::Persistent)
            .await?;
        info!("cleanup: {} done", self.id);
        self.state.set_phase(WorkerPhase::Done);
        self.session.close();
        Ok(())
    }
}
