//! Checkpoint management
//!
//! Finalized checkpoint records, per-worker metadata files and the
//! master-side operations that write and reload them.

pub mod format;
pub mod manager;

pub use format::{CheckpointMetadata, FinalizedCheckpoint, MetadataEntry};
pub use manager::{CheckpointConfig, CheckpointManager};
