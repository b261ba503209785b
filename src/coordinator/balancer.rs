//! Vertex range balancing
//!
//! A balancer proposes the next superstep's owners for the current range
//! table. The proposal must keep every range (same max ids); the master
//! then works out which ranges moved and records their previous owners.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BspError, Result};
use crate::graph::{VertexId, VertexRangeTable, WorkerId, WorkerMap};

/// Policy that reassigns ranges between supersteps
pub trait Balancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propose owners for the next superstep
    fn rebalance(
        &self,
        superstep: u64,
        previous: &VertexRangeTable,
        workers: &WorkerMap,
    ) -> Result<VertexRangeTable>;
}

/// Built-in balancing policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    /// Never move a range
    #[default]
    Static,
    /// Deal ranges round-robin over the live workers every superstep
    RoundRobin,
    /// Move ranges between live workers only until their loads are level
    Reassign,
}

impl BalancerKind {
    pub fn build(self) -> Arc<dyn Balancer> {
        match self {
            BalancerKind::Static => Arc::new(StaticBalancer),
            BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer),
            BalancerKind::Reassign => Arc::new(ReassignBalancer),
        }
    }
}

impl FromStr for BalancerKind {
    type Err = BspError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "static" => Ok(BalancerKind::Static),
            "round_robin" => Ok(BalancerKind::RoundRobin),
            "reassign" => Ok(BalancerKind::Reassign),
            other => Err(BspError::InvalidConfig {
                reason: format!("unknown balancer '{}'", other),
            }),
        }
    }
}

fn require_workers(workers: &WorkerMap, superstep: u64) -> Result<()> {
    if workers.is_empty() {
        return Err(BspError::ProtocolViolation {
            reason: format!("no workers to balance onto for superstep {}", superstep),
        });
    }
    Ok(())
}

/// Keeps every range where it is
pub struct StaticBalancer;

impl Balancer for StaticBalancer {
    fn name(&self) -> &'static str {
        "static"
    }

    fn rebalance(
        &self,
        _superstep: u64,
        previous: &VertexRangeTable,
        _workers: &WorkerMap,
    ) -> Result<VertexRangeTable> {
        Ok(previous.clone())
    }
}

/// Deals ranges over workers in id order
pub struct RoundRobinBalancer;

impl Balancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn rebalance(
        &self,
        superstep: u64,
        previous: &VertexRangeTable,
        workers: &WorkerMap,
    ) -> Result<VertexRangeTable> {
        require_workers(workers, superstep)?;
        let owners: Vec<_> = workers.values().map(|w| w.as_owner()).collect();
        let mut next = previous.clone();
        for (index, range) in next.iter_mut().enumerate() {
            range.owner = owners[index % owners.len()].clone();
        }
        Ok(next)
    }
}

/// Levels load over the live workers with the fewest moves.
///
/// Ranges only move between live workers. A range whose owner is gone is
/// left in place; its data can only come back from a checkpoint.
pub struct ReassignBalancer;

impl Balancer for ReassignBalancer {
    fn name(&self) -> &'static str {
        "reassign"
    }

    fn rebalance(
        &self,
        superstep: u64,
        previous: &VertexRangeTable,
        workers: &WorkerMap,
    ) -> Result<VertexRangeTable> {
        require_workers(workers, superstep)?;
        let mut held: BTreeMap<WorkerId, Vec<VertexId>> =
            workers.keys().map(|id| (id.clone(), Vec::new())).collect();
        for range in previous.iter() {
            if let Some(ranges) = held.get_mut(&range.owner.hostname_id) {
                ranges.push(range.max_vertex_id);
            }
        }

        let mut next = previous.clone();
        loop {
            let heaviest = held
                .iter()
                .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)))
                .map(|(id, ranges)| (id.clone(), ranges.len()));
            let lightest = held
                .iter()
                .min_by_key(|(id, ranges)| (ranges.len(), (**id).clone()))
                .map(|(id, ranges)| (id.clone(), ranges.len()));
            let (from, to) = match (heaviest, lightest) {
                (Some((from, high)), Some((to, low))) if high > low + 1 => (from, to),
                _ => break,
            };
            let max_id = match held.get_mut(&from).and_then(|ranges| ranges.pop()) {
                Some(max_id) => max_id,
                None => break,
            };
            if let (Some(range), Some(info)) = (next.get_mut(max_id), workers.get(&to)) {
                debug!("rebalance: range {} leaves {} for {}", max_id, from, to);
                range.owner = info.as_owner();
            }
            if let Some(ranges) = held.get_mut(&to) {
                ranges.push(max_id);
            }
        }
        Ok(next)
    }
}

/// Outcome of one balancing round
#[derive(Debug, Clone)]
pub struct Rebalance {
    /// Table to publish, with previous owners recorded on moved ranges
    pub next: VertexRangeTable,
    /// Max ids of ranges whose owner changed
    pub moved: BTreeSet<VertexId>,
}

/// Run `balancer` and derive the moved set.
///
/// Fails if the proposal does not contain exactly the previous ranges.
pub fn plan(
    balancer: &dyn Balancer,
    superstep: u64,
    previous: &VertexRangeTable,
    workers: &WorkerMap,
) -> Result<Rebalance> {
    let mut next = balancer.rebalance(superstep, previous, workers)?;
    if next.len() != previous.len() {
        return Err(BspError::RangeCountMismatch {
            superstep,
            expected: previous.len(),
            actual: next.len(),
        });
    }
    if next.max_ids() != previous.max_ids() {
        return Err(BspError::InvalidRangeTable {
            reason: format!(
                "balancer {} changed range boundaries on superstep {}",
                balancer.name(),
                superstep
            ),
        });
    }

    let mut moved = BTreeSet::new();
    for range in next.iter_mut() {
        range.checkpoint_file_prefix = None;
        range.previous_owner = None;
        if let Some(before) = previous.get(range.max_vertex_id) {
            if before.owner.hostname_id != range.owner.hostname_id {
                range.previous_owner = Some(before.owner.clone());
                moved.insert(range.max_vertex_id);
            }
        }
    }
    next.verify_partition()?;
    info!(
        "plan: balancer {} moves {} of {} ranges on superstep {}",
        balancer.name(),
        moved.len(),
        next.len(),
        superstep
    );
    Ok(Rebalance { next, moved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::range::tests::range;
    use crate::graph::WorkerInfo;

    fn workers(ids: &[(&str, u32)]) -> WorkerMap {
        ids.iter()
            .map(|(host, p)| {
                let info = WorkerInfo::new(*host, 7000, *p);
                (info.id(), info)
            })
            .collect()
    }

    fn table(owners: &[&str]) -> VertexRangeTable {
        VertexRangeTable::from_ordered(
            owners
                .iter()
                .enumerate()
                .map(|(i, owner)| range((i as u64 + 1) * 10 - 1, owner))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_static_moves_nothing() {
        let previous = table(&["a_0", "b_1", "a_0"]);
        let plan = plan(&StaticBalancer, 3, &previous, &workers(&[("a", 0), ("b", 1)])).unwrap();
        assert!(plan.moved.is_empty());
        assert_eq!(plan.next.len(), 3);
    }

    #[test]
    fn test_round_robin_records_previous_owner() {
        let previous = table(&["a_0", "a_0", "a_0", "a_0"]);
        let plan = plan(
            &RoundRobinBalancer,
            1,
            &previous,
            &workers(&[("a", 0), ("b", 1)]),
        )
        .unwrap();
        assert_eq!(plan.moved.iter().copied().collect::<Vec<_>>(), vec![19, 39]);
        let moved = plan.next.get(19).unwrap();
        assert_eq!(moved.owner.hostname_id, "b_1");
        assert_eq!(moved.previous_owner.as_ref().unwrap().hostname_id, "a_0");
        assert!(plan.next.get(9).unwrap().previous_owner.is_none());
    }

    #[test]
    fn test_reassign_levels_live_workers() {
        let previous = table(&["a_0", "a_0", "a_0", "a_0", "b_1"]);
        let live = workers(&[("a", 0), ("b", 1), ("c", 2)]);
        let plan = plan(&ReassignBalancer, 4, &previous, &live).unwrap();
        // The last ranges of the heaviest worker go to the lightest
        assert_eq!(plan.moved.iter().copied().collect::<Vec<_>>(), vec![29, 39]);
        assert_eq!(plan.next.get(39).unwrap().owner.hostname_id, "c_2");
        assert_eq!(plan.next.get(29).unwrap().owner.hostname_id, "b_1");
        for max_id in &plan.moved {
            let range = plan.next.get(*max_id).unwrap();
            assert_eq!(range.previous_owner.as_ref().unwrap().hostname_id, "a_0");
        }
    }

    #[test]
    fn test_reassign_leaves_departed_owner_alone() {
        let previous = table(&["a_0", "b_1", "c_2", "c_2", "a_0"]);
        let live = workers(&[("a", 0), ("b", 1)]);
        let plan = plan(&ReassignBalancer, 4, &previous, &live).unwrap();
        assert!(plan.moved.is_empty());
        assert_eq!(plan.next.get(29).unwrap().owner.hostname_id, "c_2");
    }

    struct DroppingBalancer;

    impl Balancer for DroppingBalancer {
        fn name(&self) -> &'static str {
            "dropping"
        }

        fn rebalance(
            &self,
            _superstep: u64,
            previous: &VertexRangeTable,
            _workers: &WorkerMap,
        ) -> Result<VertexRangeTable> {
            let mut ranges: Vec<_> = previous.iter().cloned().collect();
            ranges.pop();
            VertexRangeTable::from_ordered(ranges)
        }
    }

    #[test]
    fn test_cardinality_change_is_fatal() {
        let previous = table(&["a_0", "b_1"]);
        let err = plan(&DroppingBalancer, 6, &previous, &workers(&[("a", 0)])).unwrap_err();
        assert!(matches!(
            err,
            BspError::RangeCountMismatch {
                superstep: 6,
                expected: 2,
                actual: 1
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("round-robin".parse::<BalancerKind>().unwrap(), BalancerKind::RoundRobin);
        assert_eq!("Reassign".parse::<BalancerKind>().unwrap(), BalancerKind::Reassign);
        assert!("random".parse::<BalancerKind>().is_err());
    }
}
