//! Superstep barrier
//!
//! One call to [`SuperstepCoordinator::coordinate_superstep`] runs a full
//! round: choose the workers, assign or reload ranges, wait for every chosen
//! worker to finish, merge results, publish them, maybe checkpoint and
//! advance the counter. Losing a chosen worker is reported as
//! [`SuperstepState::WorkerFailure`]; everything else that goes wrong is an
//! error.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::assignment::{absent_split_owner, input_splits_to_vertex_ranges, read_split_reports};
use super::balancer;
use super::job_state::JobState;
use super::membership::WorkerHealthTracker;
use super::MasterContext;
use crate::aggregator;
use crate::coordination::records::{SuperstepSummary, WorkerFinishedReport};
use crate::coordination::{self, CreateMode};
use crate::error::{BspError, Result};
use crate::graph::{VertexId, VertexRangeStat, VertexRangeTable, WorkerId, WorkerMap};
use crate::metrics::standard;

/// Outcome of one coordination round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperstepState {
    Initial,
    WorkerFailure,
    ThisSuperstepDone,
    AllSuperstepsDone,
}

/// Phases of a round, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    CheckWorkers,
    AssignOrReload,
    AwaitFinish,
    CollectResults,
    Publish,
    MaybeCheckpoint,
    Advance,
}

/// Drives the barrier for the current superstep
pub struct SuperstepCoordinator<'a> {
    ctx: &'a MasterContext,
}

impl<'a> SuperstepCoordinator<'a> {
    pub fn new(ctx: &'a MasterContext) -> Self {
        Self { ctx }
    }

    fn enter(&self, phase: BarrierPhase, attempt: u64, superstep: u64) {
        debug!(
            "coordinate_superstep: {:?} (attempt {}, superstep {})",
            phase, attempt, superstep
        );
    }

    /// Run one round for the tracker's current `(attempt, superstep)`
    pub async fn coordinate_superstep(&self) -> Result<SuperstepState> {
        let ctx = self.ctx;
        let (attempt, superstep) = ctx.tracker.position();
        let _timer = standard::SUPERSTEP_DURATION.start_timer();

        self.enter(BarrierPhase::CheckWorkers, attempt, superstep);
        let workers = match WorkerHealthTracker::new(ctx)
            .check_workers(attempt, superstep)
            .await?
        {
            Some(workers) => workers,
            None => {
                ctx.job_state.publish(JobState::Failed, attempt, superstep).await?;
                return Err(BspError::QuorumNotMet {
                    superstep,
                    min_workers: ctx.config.health.min_workers,
                    max_workers: ctx.config.health.max_workers,
                });
            }
        };
        info!(
            "coordinate_superstep: {} chosen workers for superstep {}",
            workers.len(),
            superstep
        );
        if self.missing_worker(attempt, superstep, &workers).await?.is_some() {
            return Ok(SuperstepState::WorkerFailure);
        }

        self.enter(BarrierPhase::AssignOrReload, attempt, superstep);
        let restarting = ctx.tracker.is_restart_superstep();
        if superstep == 0 && !restarting {
            if let Some(owner) = absent_split_owner(ctx, &workers).await? {
                warn!(
                    "coordinate_superstep: split owner {} is not healthy on superstep 0",
                    owner
                );
                standard::WORKER_FAILURES_TOTAL.inc();
                return Ok(SuperstepState::WorkerFailure);
            }
        }
        if restarting {
            let files = ctx
                .checkpoints
                .map_files_to_workers(attempt, superstep, &workers)
                .await?;
            info!(
                "coordinate_superstep: reloading {} checkpoint files for superstep {}",
                files, superstep
            );
            input_splits_to_vertex_ranges(ctx, attempt, superstep, &workers).await?;
            self.finish_exchange(attempt, superstep).await?;
        } else if superstep > 0
            && !self.balance_vertex_ranges(attempt, superstep, &workers).await?
        {
            return Ok(SuperstepState::WorkerFailure);
        }

        self.enter(BarrierPhase::AwaitFinish, attempt, superstep);
        if !self.await_finish(attempt, superstep, &workers).await? {
            return Ok(SuperstepState::WorkerFailure);
        }

        self.enter(BarrierPhase::CollectResults, attempt, superstep);
        let aggregators =
            aggregator::collect_and_merge(ctx.client.as_ref(), &ctx.paths, attempt, superstep)
                .await?;
        let stats = self.collect_range_stats(attempt, superstep, &workers).await?;
        let summary = SuperstepSummary {
            finished_vertices: stats.values().map(|s| s.finished_vertex_count).sum(),
            total_vertices: stats.values().map(|s| s.vertex_count).sum(),
            total_edges: stats.values().map(|s| s.edge_count).sum(),
        };

        self.enter(BarrierPhase::Publish, attempt, superstep);
        if superstep == 0 && !restarting {
            input_splits_to_vertex_ranges(ctx, attempt, superstep, &workers).await?;
        } else {
            self.apply_stats(superstep, &stats)?;
        }
        let finished_path = ctx.paths.superstep_finished(attempt, superstep);
        let body = coordination::encode_json(&finished_path, &summary)?;
        coordination::create_or_set(ctx.client.as_ref(), &finished_path, body).await?;
        info!(
            "coordinate_superstep: superstep {} finished {} of {} vertices ({} edges, {} aggregators)",
            superstep,
            summary.finished_vertices,
            summary.total_vertices,
            summary.total_edges,
            aggregators.len()
        );

        self.enter(BarrierPhase::MaybeCheckpoint, attempt, superstep);
        if ctx.checkpoints.checkpoint_frequency_met(superstep) {
            ctx.checkpoints
                .finalize_checkpoint(attempt, superstep, &workers)
                .await?;
        }
        if superstep > 0 && !ctx.config.keep_coordination_data {
            let previous = ctx.paths.superstep(attempt, superstep - 1);
            if coordination::delete_if_present(ctx.client.as_ref(), &previous).await? {
                debug!("coordinate_superstep: removed {}", previous);
            }
        }

        self.enter(BarrierPhase::Advance, attempt, superstep);
        ctx.tracker.advance();
        standard::SUPERSTEPS_TOTAL.inc();
        if summary.all_halted() {
            Ok(SuperstepState::AllSuperstepsDone)
        } else {
            Ok(SuperstepState::ThisSuperstepDone)
        }
    }

    /// First chosen worker whose healthy node is gone; re-arms a deletion
    /// watch on every node that is still there
    async fn missing_worker(
        &self,
        attempt: u64,
        superstep: u64,
        workers: &WorkerMap,
    ) -> Result<Option<WorkerId>> {
        let ctx = self.ctx;
        for worker_id in workers.keys() {
            let path = ctx.paths.worker_healthy(attempt, superstep, worker_id);
            if !ctx.client.exists(&path, true).await? {
                warn!(
                    "missing_worker: chosen worker {} is no longer healthy on superstep {}",
                    worker_id, superstep
                );
                standard::WORKER_FAILURES_TOTAL.inc();
                return Ok(Some(worker_id.clone()));
            }
        }
        Ok(None)
    }

    /// Table of the previous superstep, from memory or from its published copy
    async fn previous_table(&self, attempt: u64, superstep: u64) -> Result<VertexRangeTable> {
        let previous = superstep - 1;
        let (installed, table) = self.ctx.tracker.table();
        if installed == Some(previous) && !table.is_empty() {
            return Ok(table);
        }
        let path = self.ctx.paths.vertex_range_assignments(attempt, previous);
        match self.ctx.client.get_data(&path, false).await {
            Ok(data) => VertexRangeTable::from_json(&path, &data),
            Err(BspError::NoNode { .. }) => Err(BspError::ProtocolViolation {
                reason: format!("no vertex range table for superstep {}", previous),
            }),
            Err(e) => Err(e),
        }
    }

    /// Rebalance, publish and wait for moved ranges to be exchanged.
    ///
    /// Returns false if a chosen worker disappeared during the exchange.
    pub async fn balance_vertex_ranges(
        &self,
        attempt: u64,
        superstep: u64,
        workers: &WorkerMap,
    ) -> Result<bool> {
        let ctx = self.ctx;
        let previous = self.previous_table(attempt, superstep).await?;
        let plan = balancer::plan(ctx.balancer.as_ref(), superstep, &previous, workers)?;
        if let Some(orphan) = plan
            .next
            .owners()
            .into_iter()
            .find(|owner| !workers.contains_key(owner))
        {
            warn!(
                "balance_vertex_ranges: balancer {} left ranges on departed worker {} for superstep {}",
                ctx.balancer.name(),
                orphan,
                superstep
            );
            standard::WORKER_FAILURES_TOTAL.inc();
            return Ok(false);
        }
        // A moved range is sent by its previous owner, which must still be alive
        if let Some(range) = plan.next.iter().find(|range| {
            range
                .previous_owner
                .as_ref()
                .is_some_and(|before| !workers.contains_key(&before.hostname_id))
        }) {
            warn!(
                "balance_vertex_ranges: range {} would move away from departed worker {} on superstep {}",
                range.max_vertex_id,
                range.previous_owner.as_ref().map_or("", |before| before.hostname_id.as_str()),
                superstep
            );
            standard::WORKER_FAILURES_TOTAL.inc();
            return Ok(false);
        }

        let path = ctx.paths.vertex_range_assignments(attempt, superstep);
        coordination::create_or_set(ctx.client.as_ref(), &path, plan.next.to_json()?).await?;
        ctx.tracker.install_table(superstep, plan.next);
        info!(
            "balance_vertex_ranges: published assignments at {} ({} moved)",
            path,
            plan.moved.len()
        );

        if !plan.moved.is_empty()
            && !self
                .await_exchange(attempt, superstep, workers, &plan.moved)
                .await?
        {
            return Ok(false);
        }
        self.finish_exchange(attempt, superstep).await?;
        Ok(true)
    }

    /// Wait until every moved range is acknowledged under the exchange dir
    async fn await_exchange(
        &self,
        attempt: u64,
        superstep: u64,
        workers: &WorkerMap,
        moved: &BTreeSet<VertexId>,
    ) -> Result<bool> {
        let ctx = self.ctx;
        let dir = ctx.paths.vertex_range_exchange_dir(attempt, superstep);
        coordination::create_if_absent(ctx.client.as_ref(), &dir, Vec::new(), CreateMode::Persistent)
            .await?;
        let exchanged = &ctx.events.vertex_range_exchange_changed;
        let state_changed = &ctx.events.superstep_state_changed;
        loop {
            exchanged.reset();
            state_changed.reset();

            let mut acked = BTreeSet::new();
            for name in coordination::children_or_empty(ctx.client.as_ref(), &dir, true).await? {
                match name.parse::<VertexId>() {
                    Ok(max_id) => {
                        acked.insert(max_id);
                    }
                    Err(_) => warn!("await_exchange: ignoring ack {}", name),
                }
            }
            if self.missing_worker(attempt, superstep, workers).await?.is_some() {
                return Ok(false);
            }
            let outstanding = moved.difference(&acked).count();
            if outstanding == 0 {
                info!(
                    "await_exchange: all {} moved ranges exchanged on superstep {}",
                    moved.len(),
                    superstep
                );
                return Ok(true);
            }
            debug!(
                "await_exchange: {} of {} moved ranges outstanding",
                outstanding,
                moved.len()
            );
            tokio::select! {
                _ = exchanged.wait() => {}
                _ = state_changed.wait() => {}
            }
        }
    }

    async fn finish_exchange(&self, attempt: u64, superstep: u64) -> Result<()> {
        let path = self.ctx.paths.vertex_range_exchange_finished(attempt, superstep);
        coordination::create_if_absent(
            self.ctx.client.as_ref(),
            &path,
            Vec::new(),
            CreateMode::Persistent,
        )
        .await?;
        Ok(())
    }

    /// Wait until every chosen worker reported; false on a lost worker
    async fn await_finish(&self, attempt: u64, superstep: u64, workers: &WorkerMap) -> Result<bool> {
        let ctx = self.ctx;
        let dir = ctx.paths.worker_finished_dir(attempt, superstep);
        coordination::create_if_absent(ctx.client.as_ref(), &dir, Vec::new(), CreateMode::Persistent)
            .await?;
        let changed = &ctx.events.superstep_state_changed;
        loop {
            changed.reset();
            let finished: BTreeSet<String> =
                coordination::children_or_empty(ctx.client.as_ref(), &dir, true)
                    .await?
                    .into_iter()
                    .collect();
            if self.missing_worker(attempt, superstep, workers).await?.is_some() {
                return Ok(false);
            }
            let waiting: Vec<&WorkerId> =
                workers.keys().filter(|id| !finished.contains(*id)).collect();
            if waiting.is_empty() {
                return Ok(true);
            }
            debug!(
                "await_finish: {} of {} workers finished superstep {}, waiting on {:?}",
                workers.len() - waiting.len(),
                workers.len(),
                superstep,
                waiting
            );
            changed.wait().await;
        }
    }

    /// Range stats of this superstep keyed by max vertex id
    async fn collect_range_stats(
        &self,
        attempt: u64,
        superstep: u64,
        workers: &WorkerMap,
    ) -> Result<BTreeMap<VertexId, VertexRangeStat>> {
        let ctx = self.ctx;
        let mut reported = Vec::new();
        if superstep == 0 {
            for (_, stats) in read_split_reports(ctx).await? {
                reported.extend(stats.into_iter().map(|mut stat| {
                    stat.finished_vertex_count = 0;
                    stat
                }));
            }
        } else {
            for worker_id in workers.keys() {
                let path = ctx.paths.worker_finished(attempt, superstep, worker_id);
                let report: WorkerFinishedReport =
                    coordination::read_json(ctx.client.as_ref(), &path).await?;
                reported.extend(report.vertex_range_stats);
            }
        }

        let mut stats = BTreeMap::new();
        for stat in reported {
            let max_id = stat.max_vertex_id;
            if stats.insert(max_id, stat).is_some() {
                return Err(BspError::ProtocolViolation {
                    reason: format!(
                        "range {} reported twice on superstep {}",
                        max_id, superstep
                    ),
                });
            }
        }
        Ok(stats)
    }

    /// Fold reported counts into the installed table
    fn apply_stats(&self, superstep: u64, stats: &BTreeMap<VertexId, VertexRangeStat>) -> Result<()> {
        let (_, mut table) = self.ctx.tracker.table();
        if let Some(unknown) = stats.keys().find(|id| table.get(**id).is_none()) {
            return Err(BspError::ProtocolViolation {
                reason: format!(
                    "stats for unassigned range {} on superstep {}",
                    unknown, superstep
                ),
            });
        }
        for range in table.iter_mut() {
            match stats.get(&range.max_vertex_id) {
                Some(stat) => {
                    range.vertex_count = stat.vertex_count;
                    range.edge_count = stat.edge_count;
                }
                None => warn!(
                    "apply_stats: no stats for range {} on superstep {}",
                    range.max_vertex_id, superstep
                ),
            }
        }
        self.ctx.tracker.install_table(superstep, table);
        Ok(())
    }
}
