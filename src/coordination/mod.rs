//! Coordination substrate interface
//!
//! The master talks to workers exclusively through a hierarchical namespace
//! of named nodes with persistent/ephemeral/sequential creation and one-shot
//! change watches. This module defines the client seam, the path layout,
//! the JSON records stored in nodes and an in-process ensemble.

pub mod memory;
pub mod paths;
pub mod records;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{BspError, Result};

pub use memory::{MemoryEnsemble, MemorySession};
pub use paths::{CoordinationPaths, PathKind};

/// Width of the counter appended to sequential node names
pub const SEQUENCE_WIDTH: usize = 10;

/// Node creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Persistent with a monotonically increasing suffix
    PersistentSequential,
    /// Deleted when the creating session closes
    Ephemeral,
    /// Ephemeral with a monotonically increasing suffix
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Kind of change a watch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub path: String,
    pub event_type: EventType,
}

/// Client for the coordination substrate
///
/// Watches are one-shot: a `watch = true` read registers interest in the
/// next change of that node (or its child list) only.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a node, returning the actual path (sequential nodes get a suffix)
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String>;

    /// Check whether a node exists, optionally watching it
    async fn exists(&self, path: &str, watch: bool) -> Result<bool>;

    /// Read a node's data, optionally watching it
    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>>;

    /// Overwrite a node's data
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// List child names (not full paths) in lexicographic order
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    /// Delete a node, optionally with all descendants
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Sequence number of a sequential node name, if it has one
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    name[name.len() - SEQUENCE_WIDTH..].parse().ok()
}

/// Sort sequential child names by their sequence suffix
pub fn sort_by_sequence(names: &mut [String]) {
    names.sort_by_key(|name| (sequence_of(name).unwrap_or(u64::MAX), name.clone()));
}

/// Create a node, treating "already exists" as success
pub async fn create_if_absent(
    client: &dyn CoordinationClient,
    path: &str,
    data: Vec<u8>,
    mode: CreateMode,
) -> Result<bool> {
    match client.create(path, data, mode, true).await {
        Ok(_) => Ok(true),
        Err(BspError::NodeExists { .. }) => {
            debug!("create_if_absent: {} already exists, no need to create", path);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Create a node or overwrite its data if it exists
pub async fn create_or_set(
    client: &dyn CoordinationClient,
    path: &str,
    data: Vec<u8>,
) -> Result<()> {
    if client.exists(path, false).await? {
        client.set_data(path, data).await
    } else {
        match client.create(path, data.clone(), CreateMode::Persistent, true).await {
            Ok(_) => Ok(()),
            Err(BspError::NodeExists { .. }) => client.set_data(path, data).await,
            Err(e) => Err(e),
        }
    }
}

/// List children, treating a missing parent as an empty list
pub async fn children_or_empty(
    client: &dyn CoordinationClient,
    path: &str,
    watch: bool,
) -> Result<Vec<String>> {
    match client.get_children(path, watch).await {
        Ok(children) => Ok(children),
        Err(BspError::NoNode { .. }) => {
            debug!("children_or_empty: no node for {}", path);
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Delete a subtree, treating a missing node as already deleted
pub async fn delete_if_present(client: &dyn CoordinationClient, path: &str) -> Result<bool> {
    match client.delete(path, true).await {
        Ok(()) => Ok(true),
        Err(BspError::NoNode { .. }) => {
            debug!("delete_if_present: {} already cleaned up", path);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Serialize a record for storage in a node
pub fn encode_json<T: Serialize>(path: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| BspError::malformed(path, e))
}

/// Decode a record stored in a node
pub fn decode_json<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| BspError::malformed(path, e))
}

/// Read and decode a JSON node
pub async fn read_json<T: DeserializeOwned>(
    client: &dyn CoordinationClient,
    path: &str,
) -> Result<T> {
    let data = client.get_data(path, false).await?;
    decode_json(path, &data)
}
