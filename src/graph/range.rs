//! Vertex ranges and the range table
//!
//! A range is identified by its maximum vertex id. Range `r` covers
//! `(max id of its predecessor, r.max_vertex_id]`; the first range starts at
//! vertex id 0. The table is kept ordered by max id, which makes the
//! partition invariant (strictly increasing, no duplicates) structural.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{VertexId, WorkerId};
use crate::error::{BspError, Result};

/// Worker that owns (or owned) a range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOwner {
    pub hostname_id: WorkerId,
    pub hostname: String,
    pub port: u16,
}

/// One contiguous range of vertex ids and its assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexRange {
    pub max_vertex_id: VertexId,
    pub vertex_count: u64,
    pub edge_count: u64,
    pub owner: RangeOwner,
    /// Set when the range moved in the current rebalance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_owner: Option<RangeOwner>,
    /// Checkpoint file the owner should load this range from on restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_file_prefix: Option<String>,
}

impl VertexRange {
    /// True if `worker` owns the range now or owned it before the last move
    pub fn involves(&self, worker: &str) -> bool {
        self.owner.hostname_id == worker
            || self
                .previous_owner
                .as_ref()
                .is_some_and(|prev| prev.hostname_id == worker)
    }
}

/// Per-range statistics reported by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexRangeStat {
    pub max_vertex_id: VertexId,
    pub vertex_count: u64,
    pub edge_count: u64,
    #[serde(default)]
    pub finished_vertex_count: u64,
    /// Reporting worker; present in input-split reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_file_prefix: Option<String>,
}

/// Ordered set of vertex ranges covering the keyspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<VertexRange>", try_from = "Vec<VertexRange>")]
pub struct VertexRangeTable {
    ranges: BTreeMap<VertexId, VertexRange>,
}

impl VertexRangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from ranges in the order they were published.
    ///
    /// The input must already be strictly increasing by max id.
    pub fn from_ordered(ranges: Vec<VertexRange>) -> Result<Self> {
        let mut table = Self::new();
        let mut last: Option<VertexId> = None;
        for range in ranges {
            if let Some(prev) = last {
                if range.max_vertex_id <= prev {
                    return Err(BspError::InvalidRangeTable {
                        reason: format!(
                            "max id {} does not follow {}",
                            range.max_vertex_id, prev
                        ),
                    });
                }
            }
            last = Some(range.max_vertex_id);
            table.ranges.insert(range.max_vertex_id, range);
        }
        Ok(table)
    }

    /// Insert a range, failing on a duplicate max id
    pub fn insert(&mut self, range: VertexRange) -> Result<()> {
        if self.ranges.contains_key(&range.max_vertex_id) {
            return Err(BspError::InvalidRangeTable {
                reason: format!("duplicate max vertex id {}", range.max_vertex_id),
            });
        }
        self.ranges.insert(range.max_vertex_id, range);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, max_vertex_id: VertexId) -> Option<&VertexRange> {
        self.ranges.get(&max_vertex_id)
    }

    pub fn get_mut(&mut self, max_vertex_id: VertexId) -> Option<&mut VertexRange> {
        self.ranges.get_mut(&max_vertex_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VertexRange> {
        self.ranges.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut VertexRange> {
        self.ranges.values_mut()
    }

    pub fn max_ids(&self) -> Vec<VertexId> {
        self.ranges.keys().copied().collect()
    }

    /// Range containing `vertex`, if any
    pub fn range_for(&self, vertex: VertexId) -> Option<&VertexRange> {
        self.ranges.range(vertex..).next().map(|(_, range)| range)
    }

    /// Inclusive `(first, last)` vertex ids covered by each range, in order
    pub fn bounds(&self) -> Vec<(VertexId, VertexId)> {
        let mut first = 0;
        self.ranges
            .keys()
            .map(|&max| {
                let bounds = (first, max);
                first = max.saturating_add(1);
                bounds
            })
            .collect()
    }

    /// Check that every range has an owner.
    ///
    /// Adjacency needs no check: a range starts right after its predecessor's
    /// max id, so [`bounds`](Self::bounds) always tiles `0..=last`. Coverage of
    /// the input keyspace is checked against the split descriptors when the
    /// workers' split reports are merged.
    pub fn verify_partition(&self) -> Result<()> {
        if let Some(orphan) = self.iter().find(|r| r.owner.hostname_id.is_empty()) {
            return Err(BspError::InvalidRangeTable {
                reason: format!("range {} has no owner", orphan.max_vertex_id),
            });
        }
        Ok(())
    }

    /// Distinct current owners
    pub fn owners(&self) -> BTreeSet<WorkerId> {
        self.iter().map(|r| r.owner.hostname_id.clone()).collect()
    }

    /// True if `worker` owns or previously owned any range
    pub fn involves(&self, worker: &str) -> bool {
        self.iter().any(|r| r.involves(worker))
    }

    pub fn total_vertices(&self) -> u64 {
        self.iter().map(|r| r.vertex_count).sum()
    }

    pub fn total_edges(&self) -> u64 {
        self.iter().map(|r| r.edge_count).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BspError::InvalidRangeTable {
            reason: e.to_string(),
        })
    }

    pub fn from_json(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| BspError::malformed(path, e))
    }
}

impl From<VertexRangeTable> for Vec<VertexRange> {
    fn from(table: VertexRangeTable) -> Self {
        table.ranges.into_values().collect()
    }
}

impl TryFrom<Vec<VertexRange>> for VertexRangeTable {
    type Error = BspError;

    fn try_from(ranges: Vec<VertexRange>) -> Result<Self> {
        Self::from_ordered(ranges)
    }
}
