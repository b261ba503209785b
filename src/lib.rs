//! Superstep Core - master-side coordination for bulk-synchronous graph jobs
//!
//! This crate provides the pieces a master needs to drive a job:
//! - Leader election and worker health checks
//! - Input splits and vertex range assignment
//! - The superstep barrier with aggregator merging
//! - Checkpoint finalization and restart after worker loss

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod graph;
pub mod local;
pub mod metrics;
pub mod runtime;
pub mod storage;

pub use config::MasterConfig;
pub use coordinator::{JobOutcome, MasterContext, MasterDriver};
pub use error::{BspError, Result};
