//! Error types for the BSP master
//!
//! Error taxonomy covering the coordination substrate, bulk storage,
//! quorum and liveness failures, protocol violations and checkpoints.

use thiserror::Error;

/// Primary error type for all master operations
#[derive(Debug, Error)]
pub enum BspError {
    // ========== Coordination Errors ==========

    /// Node already exists on create
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// Node does not exist
    #[error("No node: {path}")]
    NoNode { path: String },

    /// Node has children and a non-recursive delete was requested
    #[error("Node not empty: {path}")]
    NotEmpty { path: String },

    /// Coordination session is closed or expired
    #[error("Coordination session {session} is closed")]
    SessionClosed { session: u64 },

    /// Record stored in a node could not be decoded
    #[error("Malformed record at {path}: {reason}")]
    MalformedRecord { path: String, reason: String },

    // ========== Storage Errors ==========

    /// Object storage operation failed
    #[error("Storage operation failed: {message}")]
    StorageError { message: String },

    /// Object not found in storage
    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    // ========== Quorum / Liveness Errors ==========

    /// Not enough workers responded or were healthy
    #[error("Quorum not met on superstep {superstep}: need {min_workers} healthy of {max_workers}")]
    QuorumNotMet {
        superstep: u64,
        min_workers: usize,
        max_workers: usize,
    },

    /// A worker failed and there is no checkpoint to restart from
    #[error("Worker failure on superstep {superstep} with no checkpoint to restart from")]
    UnrecoverableWorkerFailure { superstep: u64 },

    /// Restart budget exhausted
    #[error("Gave up after {attempts} restarts")]
    RestartLimitExceeded { attempts: u32 },

    // ========== Protocol Errors ==========

    /// Rebalancing changed the number of vertex ranges
    #[error("Vertex range count changed from {expected} to {actual} on superstep {superstep}")]
    RangeCountMismatch {
        superstep: u64,
        expected: usize,
        actual: usize,
    },

    /// Vertex range table does not partition the keyspace
    #[error("Invalid vertex range table: {reason}")]
    InvalidRangeTable { reason: String },

    /// A report referenced a worker that was not chosen for the superstep
    #[error("Worker {worker_id} is not a chosen worker for superstep {superstep}")]
    UnknownWorker { worker_id: String, superstep: u64 },

    /// Any other protocol invariant violation
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    // ========== Checkpoint Errors ==========

    /// Checkpoint file or metadata is malformed
    #[error("Invalid checkpoint {key}: {reason}")]
    CheckpointInvalid { key: String, reason: String },

    /// Requested checkpoint does not exist
    #[error("No finalized checkpoint for superstep {superstep}")]
    NoCheckpointFound { superstep: u64 },

    // ========== Configuration Errors ==========

    /// Configuration rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BspError {
    /// Returns true for coordination errors that mean a previous partial run
    /// already made the desired progress
    pub fn is_transient(&self) -> bool {
        matches!(self, BspError::NodeExists { .. } | BspError::NoNode { .. })
    }

    /// Returns true if this error must never be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BspError::RangeCountMismatch { .. }
                | BspError::InvalidRangeTable { .. }
                | BspError::UnknownWorker { .. }
                | BspError::ProtocolViolation { .. }
                | BspError::MalformedRecord { .. }
                | BspError::CheckpointInvalid { .. }
        )
    }

    /// Returns true if a restart from checkpoint may recover from this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BspError::QuorumNotMet { .. } | BspError::StorageError { .. }
        )
    }

    pub(crate) fn malformed(path: &str, err: impl std::fmt::Display) -> Self {
        BspError::MalformedRecord {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias for master operations
pub type Result<T> = std::result::Result<T, BspError>;

/// Swallow already-exists / no-node errors, logging them at debug level.
///
/// Returns `Ok(None)` when the error was swallowed.
pub(crate) fn ignore_transient<T>(op: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_transient() => {
            tracing::debug!("{}: {}, continuing", op, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
