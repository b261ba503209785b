//! Checkpoint manager
//!
//! Writes the finalized record for a superstep, finds the newest finalized
//! checkpoint and, on restart, turns a checkpoint back into input-split
//! reports so the normal split-to-range conversion can rebuild the table.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::format::{CheckpointMetadata, FinalizedCheckpoint};
use crate::coordination::{self, CoordinationClient, CoordinationPaths};
use crate::error::{BspError, Result};
use crate::graph::{VertexRangeStat, WorkerMap};
use crate::metrics::standard;
use crate::storage::ObjectStore;

const FINALIZED_SUFFIX: &str = ".finalized";
const METADATA_SUFFIX: &str = ".metadata";

/// Configuration for checkpointing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint every N supersteps; 0 disables checkpointing
    pub frequency: u64,
    /// Key prefix of this job's checkpoint files
    pub base_path: String,
    /// Delete all checkpoint files once the job finishes successfully
    pub cleanup_after_success: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            frequency: 2,
            base_path: "checkpoints/job".into(),
            cleanup_after_success: false,
        }
    }
}

impl CheckpointConfig {
    /// True when superstep `superstep` should be checkpointed
    pub fn frequency_met(&self, superstep: u64) -> bool {
        self.frequency > 0 && superstep % self.frequency == 0
    }

    pub fn finalized_key(&self, superstep: u64) -> String {
        format!("{}/{}{}", self.base_path, superstep, FINALIZED_SUFFIX)
    }

    /// Prefix of the files a worker writes for a superstep
    pub fn file_prefix(&self, superstep: u64, worker_id: &str) -> String {
        format!("{}/{}.{}", self.base_path, superstep, worker_id)
    }

    pub fn metadata_key(prefix: &str) -> String {
        format!("{}{}", prefix, METADATA_SUFFIX)
    }

    /// Superstep of a finalized key under this base path
    fn parse_finalized(&self, key: &str) -> Option<u64> {
        key.strip_prefix(&self.base_path)?
            .strip_prefix('/')?
            .strip_suffix(FINALIZED_SUFFIX)?
            .parse()
            .ok()
    }
}

/// Checkpoint manager for one job
pub struct CheckpointManager {
    storage: Arc<dyn ObjectStore>,
    client: Arc<dyn CoordinationClient>,
    paths: CoordinationPaths,
    config: CheckpointConfig,
    /// Last superstep finalized by this master
    last_checkpointed: RwLock<Option<u64>>,
    /// Cached result of the storage scan
    last_good: RwLock<Option<u64>>,
}

impl CheckpointManager {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        client: Arc<dyn CoordinationClient>,
        paths: CoordinationPaths,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            storage,
            client,
            paths,
            config,
            last_checkpointed: RwLock::new(None),
            last_good: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn checkpoint_frequency_met(&self, superstep: u64) -> bool {
        self.config.frequency_met(superstep)
    }

    pub async fn last_checkpointed(&self) -> Option<u64> {
        *self.last_checkpointed.read().await
    }

    /// Write the finalized record for `superstep`, replacing any previous one.
    ///
    /// The record lists one file prefix per chosen worker and carries the
    /// merged aggregators of the preceding superstep.
    pub async fn finalize_checkpoint(
        &self,
        attempt: u64,
        superstep: u64,
        workers: &WorkerMap,
    ) -> Result<()> {
        let key = self.config.finalized_key(superstep);
        let aggregator_data = if superstep > 0 {
            let merged = self.paths.merged_aggregators(attempt, superstep - 1);
            match self.client.get_data(&merged, false).await {
                Ok(data) => data,
                Err(BspError::NoNode { .. }) => {
                    debug!("finalize_checkpoint: no merged aggregators at {}", merged);
                    Vec::new()
                }
                Err(e) => return Err(e),
            }
        } else {
            Vec::new()
        };

        let record = FinalizedCheckpoint {
            file_prefixes: workers
                .keys()
                .map(|id| self.config.file_prefix(superstep, id))
                .collect(),
            aggregator_data,
        };

        if self.storage.object_exists(&key).await? {
            warn!("finalize_checkpoint: replacing existing {}", key);
        }
        self.storage.put_object(&key, record.encode()?).await?;

        *self.last_checkpointed.write().await = Some(superstep);
        {
            let mut last_good = self.last_good.write().await;
            if last_good.map_or(true, |s| superstep > s) {
                *last_good = Some(superstep);
            }
        }
        standard::CHECKPOINTS_FINALIZED_TOTAL.inc();
        info!(
            "finalize_checkpoint: finalized superstep {} with {} files and {} aggregator bytes",
            superstep,
            record.file_prefixes.len(),
            record.aggregator_data.len()
        );
        Ok(())
    }

    /// Reload a finalized checkpoint onto a fresh attempt.
    ///
    /// Restores the merged aggregators of `superstep - 1` and hands the ranges
    /// of each checkpoint file to a worker, round-robin over `workers` in id
    /// order. Returns the number of split reports written.
    pub async fn map_files_to_workers(
        &self,
        attempt: u64,
        superstep: u64,
        workers: &WorkerMap,
    ) -> Result<usize> {
        if workers.is_empty() {
            return Err(BspError::ProtocolViolation {
                reason: format!("no workers to load checkpoint {}", superstep),
            });
        }
        let key = self.config.finalized_key(superstep);
        let data = match self.storage.get_object(&key).await {
            Ok(data) => data,
            Err(BspError::ObjectNotFound { .. }) => {
                return Err(BspError::NoCheckpointFound { superstep })
            }
            Err(e) => return Err(e),
        };
        let record = FinalizedCheckpoint::decode(&key, &data)?;

        if superstep > 0 {
            let merged = self.paths.merged_aggregators(attempt, superstep - 1);
            coordination::create_or_set(self.client.as_ref(), &merged, record.aggregator_data.clone())
                .await?;
            debug!(
                "map_files_to_workers: restored {} aggregator bytes to {}",
                record.aggregator_data.len(),
                merged
            );
        }

        let chosen: Vec<&String> = workers.keys().collect();
        let mut written = 0;
        for (index, prefix) in record.file_prefixes.iter().enumerate() {
            let metadata_key = CheckpointConfig::metadata_key(prefix);
            let metadata_bytes = self.storage.get_object(&metadata_key).await?;
            let metadata = CheckpointMetadata::decode(&metadata_key, &metadata_bytes)?;
            if metadata.entries.is_empty() {
                debug!("map_files_to_workers: {} holds no ranges", prefix);
                continue;
            }

            let worker = chosen[index % chosen.len()];
            let stats: Vec<VertexRangeStat> = metadata
                .entries
                .iter()
                .map(|entry| VertexRangeStat {
                    max_vertex_id: entry.max_vertex_id,
                    vertex_count: entry.vertex_count.max(0) as u64,
                    edge_count: entry.edge_count.max(0) as u64,
                    finished_vertex_count: 0,
                    hostname_id: Some(worker.clone()),
                    checkpoint_file_prefix: Some(prefix.clone()),
                })
                .collect();

            let path = self.paths.input_split_finished(index);
            let body = coordination::encode_json(&path, &stats)?;
            coordination::create_or_set(self.client.as_ref(), &path, body).await?;
            info!(
                "map_files_to_workers: {} ({} ranges) -> {}",
                prefix,
                stats.len(),
                worker
            );
            written += 1;
        }
        Ok(written)
    }

    /// Newest finalized checkpoint, by numeric superstep
    pub async fn last_good_checkpoint(&self) -> Result<Option<u64>> {
        if let Some(cached) = *self.last_good.read().await {
            return Ok(Some(cached));
        }
        let prefix = format!("{}/", self.config.base_path);
        let latest = self
            .storage
            .list_objects(&prefix)
            .await?
            .iter()
            .filter_map(|key| self.config.parse_finalized(key))
            .max();
        if let Some(superstep) = latest {
            *self.last_good.write().await = Some(superstep);
            info!("last_good_checkpoint: superstep {}", superstep);
        }
        Ok(latest)
    }

    /// Remove every checkpoint object of this job
    pub async fn delete_all(&self) -> Result<usize> {
        let removed = self
            .storage
            .delete_prefix(&format!("{}/", self.config.base_path))
            .await?;
        *self.last_good.write().await = None;
        info!("delete_all: removed {} checkpoint objects", removed);
        Ok(removed)
    }

    /// Write a worker's metadata file; used by in-process workers
    pub async fn write_metadata(&self, prefix: &str, metadata: &CheckpointMetadata) -> Result<()> {
        self.storage
            .put_object(&CheckpointConfig::metadata_key(prefix), metadata.encode())
            .await
    }

    /// Raw finalized bytes, for inspection
    pub async fn read_finalized(&self, superstep: u64) -> Result<Bytes> {
        self.storage.get_object(&self.config.finalized_key(superstep)).await
    }
}
