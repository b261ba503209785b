//! JSON records stored in coordination nodes

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorEntry;
use crate::graph::{VertexId, VertexRangeStat, WorkerId};

/// Content of a worker's healthy node: `[hostname, port]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRegistration(pub String, pub u16);

impl HealthRegistration {
    pub fn hostname(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        self.1
    }
}

/// Description of one unit of input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSplit {
    /// First vertex id in the split (inclusive)
    pub first_vertex_id: VertexId,
    /// Last vertex id in the split (inclusive)
    pub last_vertex_id: VertexId,
    /// Optional storage location the worker should read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Content of `input-splits/{i}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSplitRecord {
    pub descriptor: InputSplit,
    pub assigned_worker: WorkerId,
}

/// Content of `worker-finished/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerFinishedReport {
    pub vertex_range_stats: Vec<VertexRangeStat>,
    #[serde(default)]
    pub aggregators: Vec<AggregatorEntry>,
}

/// Content of `superstep-finished`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperstepSummary {
    pub finished_vertices: u64,
    pub total_vertices: u64,
    pub total_edges: u64,
}

impl SuperstepSummary {
    /// True when every vertex voted to halt
    pub fn all_halted(&self) -> bool {
        self.finished_vertices == self.total_vertices
    }
}
