//! Input splits and the superstep-0 range table
//!
//! Before superstep 0 the master carves the input into splits and deals
//! them to the healthy workers. Each worker loads its splits and reports the
//! ranges it found below `input-splits/{i}/finished`; the master turns those
//! reports into the authoritative range table.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::job_state::JobState;
use super::membership::WorkerHealthTracker;
use super::MasterContext;
use crate::coordination::records::{InputSplit, InputSplitRecord};
use crate::coordination::{self, CreateMode};
use crate::error::{ignore_transient, BspError, Result};
use crate::graph::{VertexRange, VertexRangeStat, VertexRangeTable, WorkerId, WorkerMap};

/// Produces the input splits of a job
pub trait InputSplitSource: Send + Sync {
    /// Split the input; `worker_hint` is the number of healthy workers
    fn splits(&self, worker_hint: usize) -> Result<Vec<InputSplit>>;
}

/// Evenly divided vertex id space `[0, total_vertices)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub total_vertices: u64,
    pub splits_per_worker: usize,
    /// Location recorded in every split descriptor
    pub location: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            total_vertices: 1000,
            splits_per_worker: 1,
            location: None,
        }
    }
}

impl InputConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_vertices == 0 || self.splits_per_worker == 0 {
            return Err(BspError::InvalidConfig {
                reason: format!(
                    "input needs vertices and splits (total_vertices {}, splits_per_worker {})",
                    self.total_vertices, self.splits_per_worker
                ),
            });
        }
        Ok(())
    }
}

impl InputSplitSource for InputConfig {
    fn splits(&self, worker_hint: usize) -> Result<Vec<InputSplit>> {
        self.validate()?;
        let wanted = (worker_hint.max(1) * self.splits_per_worker) as u64;
        let count = wanted.min(self.total_vertices);
        Ok((0..count)
            .map(|i| InputSplit {
                first_vertex_id: i * self.total_vertices / count,
                last_vertex_id: (i + 1) * self.total_vertices / count - 1,
                location: self.location.clone(),
            })
            .collect())
    }
}

/// Create the input splits once; later calls return the recorded count.
///
/// Waits for a worker quorum on superstep 0 and deals the splits
/// round-robin over the healthy workers in id order.
pub async fn create_input_splits(ctx: &MasterContext) -> Result<usize> {
    let client = ctx.client.as_ref();
    let root = ctx.paths.input_splits();
    if client.exists(&root, false).await? {
        let data = client.get_data(&root, false).await?;
        let count = match coordination::decode_json::<usize>(&root, &data) {
            Ok(count) => count,
            Err(_) => client.get_children(&root, false).await?.len(),
        };
        info!(
            "create_input_splits: {} already exists with {} splits, no need to create",
            root, count
        );
        return Ok(count);
    }
    info!("create_input_splits: need to create the input splits at {}", root);

    let attempt = ctx.tracker.application_attempt();
    let workers = match WorkerHealthTracker::new(ctx).check_workers(attempt, 0).await? {
        Some(workers) => workers,
        None => {
            ctx.job_state.publish(JobState::Failed, attempt, 0).await?;
            return Err(BspError::QuorumNotMet {
                superstep: 0,
                min_workers: ctx.config.health.min_workers,
                max_workers: ctx.config.health.max_workers,
            });
        }
    };

    let splits = ctx.splits.splits(workers.len())?;
    if splits.is_empty() {
        return Err(BspError::ProtocolViolation {
            reason: "input split source produced no splits".into(),
        });
    }
    if splits.len() != workers.len() {
        warn!(
            "create_input_splits: number of input splits {} differs from {} healthy workers",
            splits.len(),
            workers.len()
        );
    }

    let split_count = splits.len();
    let count_data = coordination::encode_json(&root, &split_count)?;
    coordination::create_if_absent(client, &root, count_data, CreateMode::Persistent).await?;

    let owners: Vec<&String> = workers.keys().collect();
    for (index, split) in splits.into_iter().enumerate() {
        let path = ctx.paths.input_split(index);
        let record = InputSplitRecord {
            descriptor: split,
            assigned_worker: owners[index % owners.len()].clone(),
        };
        let data = coordination::encode_json(&path, &record)?;
        let created = ignore_transient(
            "create_input_splits",
            client.create(&path, data, CreateMode::Persistent, true).await,
        )?;
        if created.is_some() {
            debug!(
                "create_input_splits: created split {} for {}",
                index, record.assigned_worker
            );
        }
    }

    coordination::create_if_absent(
        client,
        &ctx.paths.input_splits_all_ready(),
        Vec::new(),
        CreateMode::Persistent,
    )
    .await?;
    info!(
        "create_input_splits: {} splits ready for {} workers",
        split_count,
        owners.len()
    );
    Ok(split_count)
}

/// Split records in split order; splits recreated from a checkpoint carry
/// no record and are left out
async fn read_split_records(ctx: &MasterContext) -> Result<Vec<(String, Option<InputSplitRecord>)>> {
    let client = ctx.client.as_ref();
    let root = ctx.paths.input_splits();
    let mut names = coordination::children_or_empty(client, &root, false).await?;
    names.sort_by_key(|name| (name.parse::<u64>().unwrap_or(u64::MAX), name.clone()));

    let mut records = Vec::with_capacity(names.len());
    for name in names {
        let path = coordination::join(&root, &name);
        let data = client.get_data(&path, false).await?;
        let record = if data.is_empty() {
            None
        } else {
            Some(coordination::decode_json::<InputSplitRecord>(&path, &data)?)
        };
        records.push((name, record));
    }
    Ok(records)
}

/// First worker dealt an input split that is not among `workers`
pub(crate) async fn absent_split_owner(
    ctx: &MasterContext,
    workers: &WorkerMap,
) -> Result<Option<WorkerId>> {
    Ok(read_split_records(ctx)
        .await?
        .into_iter()
        .filter_map(|(_, record)| record)
        .map(|record| record.assigned_worker)
        .find(|owner| !workers.contains_key(owner)))
}

/// Ranges reported for a split must lie inside it and end on its last vertex
fn check_split_coverage(path: &str, split: &InputSplit, stats: &[VertexRangeStat]) -> Result<()> {
    let outside = stats.iter().find(|stat| {
        stat.max_vertex_id < split.first_vertex_id || stat.max_vertex_id > split.last_vertex_id
    });
    if let Some(stat) = outside {
        return Err(BspError::ProtocolViolation {
            reason: format!(
                "{} reports range {} outside split [{}, {}]",
                path, stat.max_vertex_id, split.first_vertex_id, split.last_vertex_id
            ),
        });
    }
    if stats.iter().map(|stat| stat.max_vertex_id).max() != Some(split.last_vertex_id) {
        return Err(BspError::ProtocolViolation {
            reason: format!(
                "{} does not cover split [{}, {}]",
                path, split.first_vertex_id, split.last_vertex_id
            ),
        });
    }
    Ok(())
}

/// Read the per-split range reports in split order.
///
/// Every split must have a finished report; a missing one means its worker
/// never loaded it.
pub(crate) async fn read_split_reports(
    ctx: &MasterContext,
) -> Result<Vec<(String, Vec<VertexRangeStat>)>> {
    let client = ctx.client.as_ref();
    let mut reports = Vec::new();
    for (name, record) in read_split_records(ctx).await? {
        let path = ctx.paths.input_split_finished_of(&name);
        let data = match client.get_data(&path, false).await {
            Ok(data) => data,
            Err(BspError::NoNode { .. }) => {
                let owner = record
                    .as_ref()
                    .map(|r| r.assigned_worker.as_str())
                    .unwrap_or("unknown");
                return Err(BspError::ProtocolViolation {
                    reason: format!("split {} of {} has no finished report", name, owner),
                });
            }
            Err(e) => return Err(e),
        };
        let stats: Vec<VertexRangeStat> = if data.is_empty() {
            Vec::new()
        } else {
            coordination::decode_json(&path, &data)?
        };
        match &record {
            Some(record) => check_split_coverage(&path, &record.descriptor, &stats)?,
            None if stats.is_empty() => {
                info!("read_split_reports: no vertex ranges in {}", path);
                continue;
            }
            None => {}
        }
        reports.push((path, stats));
    }
    Ok(reports)
}

/// Build, publish and install the range table from the split reports.
///
/// Every reported owner must be one of `workers`.
pub async fn input_splits_to_vertex_ranges(
    ctx: &MasterContext,
    attempt: u64,
    superstep: u64,
    workers: &WorkerMap,
) -> Result<VertexRangeTable> {
    let mut table = VertexRangeTable::new();
    for (path, stats) in read_split_reports(ctx).await? {
        for stat in stats {
            let owner_id = stat.hostname_id.clone().ok_or_else(|| BspError::MalformedRecord {
                path: path.clone(),
                reason: format!("range {} has no owner", stat.max_vertex_id),
            })?;
            let owner = workers.get(&owner_id).ok_or_else(|| BspError::UnknownWorker {
                worker_id: owner_id.clone(),
                superstep,
            })?;
            table.insert(VertexRange {
                max_vertex_id: stat.max_vertex_id,
                vertex_count: stat.vertex_count,
                edge_count: stat.edge_count,
                owner: owner.as_owner(),
                previous_owner: None,
                checkpoint_file_prefix: stat.checkpoint_file_prefix,
            })?;
        }
    }
    if table.is_empty() {
        return Err(BspError::ProtocolViolation {
            reason: format!("no vertex ranges reported for superstep {}", superstep),
        });
    }
    table.verify_partition()?;

    let path = ctx.paths.vertex_range_assignments(attempt, superstep);
    coordination::create_or_set(ctx.client.as_ref(), &path, table.to_json()?).await?;
    info!(
        "input_splits_to_vertex_ranges: assigning {} vertex ranges to {}",
        table.len(),
        path
    );
    ctx.tracker.install_table(superstep, table.clone());
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::coordination::CoordinationClient;
    use crate::coordinator::test_support::Harness;
    use crate::graph::WorkerInfo;
    use std::time::Duration;

    fn config(workers: usize, total_vertices: u64) -> MasterConfig {
        let mut config = MasterConfig::default();
        config.health.max_workers = workers;
        config.health.min_workers = workers;
        config.health.poll_period = Duration::from_millis(20);
        config.health.max_poll_attempts = 2;
        config.input.total_vertices = total_vertices;
        config
    }

    fn stat(max: u64, count: u64, owner: &str) -> VertexRangeStat {
        VertexRangeStat {
            max_vertex_id: max,
            vertex_count: count,
            edge_count: count * 2,
            finished_vertex_count: 0,
            hostname_id: Some(owner.into()),
            checkpoint_file_prefix: None,
        }
    }

    #[test]
    fn test_even_splits_cover_input() {
        let input = InputConfig {
            total_vertices: 10,
            splits_per_worker: 1,
            location: None,
        };
        let splits = input.splits(3).unwrap();
        let bounds: Vec<_> = splits
            .iter()
            .map(|s| (s.first_vertex_id, s.last_vertex_id))
            .collect();
        assert_eq!(bounds, vec![(0, 2), (3, 5), (6, 9)]);

        // Never more splits than vertices
        assert_eq!(input.splits(40).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_splits_dealt_round_robin_once() {
        let harness = Harness::new();
        let master = harness.master(config(2, 100));
        let _a = harness.register_healthy(0, 0, "node", 0).await;
        let _b = harness.register_healthy(0, 0, "node", 1).await;

        assert_eq!(create_input_splits(&master.ctx).await.unwrap(), 2);
        let paths = harness.paths();
        let session = harness.session();
        let second: InputSplitRecord = coordination::read_json(&session, &paths.input_split(1))
            .await
            .unwrap();
        assert_eq!(second.assigned_worker, "node_1");
        assert_eq!(second.descriptor.first_vertex_id, 50);
        assert!(session
            .exists(&paths.input_splits_all_ready(), false)
            .await
            .unwrap());

        // Second call is a no-op
        assert_eq!(create_input_splits(&master.ctx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_no_quorum_fails_job() {
        let harness = Harness::new();
        let master = harness.master(config(2, 100));
        let _a = harness.register_healthy(0, 0, "node", 0).await;

        let err = create_input_splits(&master.ctx).await.unwrap_err();
        assert!(matches!(err, BspError::QuorumNotMet { superstep: 0, .. }));
        let latest = master.ctx.job_state.latest(false).await.unwrap().unwrap();
        assert_eq!(latest.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_split_reports_become_table() {
        let harness = Harness::new();
        let master = harness.master(config(2, 40));
        let paths = harness.paths();
        let session = harness.session();
        let reports = [
            (0, vec![stat(9, 10, "a_0"), stat(19, 10, "a_0")]),
            (1, vec![stat(39, 20, "b_1")]),
            (2, vec![stat(29, 10, "b_1")]),
        ];
        for (index, stats) in &reports {
            let path = paths.input_split_finished(*index);
            session
                .create(
                    &path,
                    coordination::encode_json(&path, stats).unwrap(),
                    CreateMode::Persistent,
                    true,
                )
                .await
                .unwrap();
        }
        let workers: WorkerMap = [WorkerInfo::new("a", 7001, 0), WorkerInfo::new("b", 7002, 1)]
            .into_iter()
            .map(|w| (w.id(), w))
            .collect();

        let table = input_splits_to_vertex_ranges(&master.ctx, 0, 0, &workers)
            .await
            .unwrap();
        assert_eq!(table.max_ids(), vec![9, 19, 29, 39]);
        assert_eq!(table.get(29).unwrap().owner.port, 7002);
        assert_eq!(master.ctx.tracker.table().0, Some(0));

        let published = session
            .get_data(&paths.vertex_range_assignments(0, 0), false)
            .await
            .unwrap();
        let published = VertexRangeTable::from_json("assignments", &published).unwrap();
        assert_eq!(published.total_vertices(), 50);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_fatal() {
        let harness = Harness::new();
        let master = harness.master(config(1, 10));
        let session = harness.session();
        let path = harness.paths().input_split_finished(0);
        session
            .create(
                &path,
                coordination::encode_json(&path, &vec![stat(9, 10, "gone_3")]).unwrap(),
                CreateMode::Persistent,
                true,
            )
            .await
            .unwrap();
        let workers: WorkerMap = [WorkerInfo::new("a", 7001, 0)]
            .into_iter()
            .map(|w| (w.id(), w))
            .collect();

        let err = input_splits_to_vertex_ranges(&master.ctx, 0, 0, &workers)
            .await
            .unwrap_err();
        assert!(matches!(err, BspError::UnknownWorker { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_split_report_is_fatal() {
        let harness = Harness::new();
        let master = harness.master(config(2, 100));
        let _a = harness.register_healthy(0, 0, "node", 0).await;
        let _b = harness.register_healthy(0, 0, "node", 1).await;
        create_input_splits(&master.ctx).await.unwrap();

        // Only the first split is loaded
        let session = harness.session();
        let path = harness.paths().input_split_finished(0);
        session
            .create(
                &path,
                coordination::encode_json(&path, &vec![stat(49, 50, "node_0")]).unwrap(),
                CreateMode::Persistent,
                true,
            )
            .await
            .unwrap();
        let workers = WorkerHealthTracker::new(&master.ctx)
            .check_workers(0, 0)
            .await
            .unwrap()
            .unwrap();

        let err = input_splits_to_vertex_ranges(&master.ctx, 0, 0, &workers)
            .await
            .unwrap_err();
        assert!(matches!(err, BspError::ProtocolViolation { .. }));
        assert_eq!(master.ctx.tracker.table().0, None);
    }

    #[tokio::test]
    async fn test_report_must_cover_its_split() {
        let harness = Harness::new();
        let master = harness.master(config(1, 50));
        let _a = harness.register_healthy(0, 0, "node", 0).await;
        create_input_splits(&master.ctx).await.unwrap();

        // Split is [0, 49] but the report stops at 39
        let session = harness.session();
        let path = harness.paths().input_split_finished(0);
        session
            .create(
                &path,
                coordination::encode_json(&path, &vec![stat(39, 40, "node_0")]).unwrap(),
                CreateMode::Persistent,
                true,
            )
            .await
            .unwrap();
        let workers = WorkerHealthTracker::new(&master.ctx)
            .check_workers(0, 0)
            .await
            .unwrap()
            .unwrap();

        let err = input_splits_to_vertex_ranges(&master.ctx, 0, 0, &workers)
            .await
            .unwrap_err();
        assert!(matches!(err, BspError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_absent_split_owner() {
        let harness = Harness::new();
        let master = harness.master(config(2, 100));
        let _a = harness.register_healthy(0, 0, "node", 0).await;
        let _b = harness.register_healthy(0, 0, "node", 1).await;
        create_input_splits(&master.ctx).await.unwrap();

        let only_first: WorkerMap = [WorkerInfo::new("node", 9000, 0)]
            .into_iter()
            .map(|w| (w.id(), w))
            .collect();
        assert_eq!(
            absent_split_owner(&master.ctx, &only_first).await.unwrap(),
            Some("node_1".to_string())
        );
    }
}
