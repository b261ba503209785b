//! Graph-level descriptors
//!
//! Worker descriptors and the vertex range table the master assigns.

pub mod range;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use range::{RangeOwner, VertexRange, VertexRangeStat, VertexRangeTable};

/// Vertex identifier; ranges are ordered by it
pub type VertexId = u64;

/// Worker identifier of the form `{hostname}_{partition}`
pub type WorkerId = String;

/// Chosen workers for a superstep, keyed and ordered by worker id
pub type WorkerMap = BTreeMap<WorkerId, WorkerInfo>;

/// Build a worker id from its parts
pub fn worker_id(hostname: &str, partition_id: u32) -> WorkerId {
    format!("{}_{}", hostname, partition_id)
}

/// Split a worker id back into hostname and partition
pub fn parse_worker_id(id: &str) -> Option<(&str, u32)> {
    let (hostname, partition) = id.rsplit_once('_')?;
    Some((hostname, partition.parse().ok()?))
}

/// Worker health as observed by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerHealth {
    Healthy,
    Unhealthy,
    Unregistered,
}

/// Endpoint and partition of a chosen worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub hostname: String,
    pub port: u16,
    pub partition_id: u32,
    pub health: WorkerHealth,
}

impl WorkerInfo {
    pub fn new(hostname: impl Into<String>, port: u16, partition_id: u32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            partition_id,
            health: WorkerHealth::Healthy,
        }
    }

    pub fn id(&self) -> WorkerId {
        worker_id(&self.hostname, self.partition_id)
    }

    /// Owner record for a range assigned to this worker
    pub fn as_owner(&self) -> RangeOwner {
        RangeOwner {
            hostname_id: self.id(),
            hostname: self.hostname.clone(),
            port: self.port,
        }
    }
}
