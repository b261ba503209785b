//! Bulk object storage
//!
//! Checkpoint files live in an object store addressed by string keys with
//! `/` separators. Writes replace an object atomically: readers observe
//! either the old content or the new content, never a partial object.

pub mod http;
pub mod local;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

pub use http::{HttpObjectStore, HttpStoreConfig};
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

/// Object storage seam used by the checkpoint manager
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    /// Atomically create or replace an object
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    async fn object_exists(&self, key: &str) -> Result<bool>;

    /// Delete every object under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_objects(prefix).await?;
        for key in &keys {
            self.delete_object(key).await?;
        }
        debug!("Deleted {} objects under {}", keys.len(), prefix);
        Ok(keys.len())
    }
}

/// Which object store backs checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory,
    Local { root: std::path::PathBuf },
    Http(HttpStoreConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Open the configured store
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config {
        StorageConfig::Memory => Arc::new(MemoryObjectStore::new()),
        StorageConfig::Local { root } => Arc::new(LocalObjectStore::new(root).await?),
        StorageConfig::Http(http) => Arc::new(HttpObjectStore::new(http.clone())?),
    };
    Ok(store)
}
