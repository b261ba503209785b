//! Superstep and attempt tracking
//!
//! Owns the superstep counter, the application attempt and the range table
//! of the most recent assignment. The table sits behind the same mutex as
//! the counters so the health-deletion handler always sees a consistent
//! (superstep, table) pair.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::graph::VertexRangeTable;
use crate::metrics::standard;

#[derive(Debug, Default)]
struct TrackerState {
    application_attempt: u64,
    superstep: u64,
    restarted_superstep: Option<u64>,
    /// Superstep the table was installed for
    table_superstep: Option<u64>,
    table: VertexRangeTable,
}

/// Shared superstep counters and range table
#[derive(Debug, Clone, Default)]
pub struct SuperstepTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl SuperstepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn superstep(&self) -> u64 {
        self.state.lock().superstep
    }

    pub fn application_attempt(&self) -> u64 {
        self.state.lock().application_attempt
    }

    /// `(attempt, superstep)` read under one lock
    pub fn position(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.application_attempt, state.superstep)
    }

    pub fn restarted_superstep(&self) -> Option<u64> {
        self.state.lock().restarted_superstep
    }

    /// True if the current superstep must reload from a checkpoint
    pub fn is_restart_superstep(&self) -> bool {
        let state = self.state.lock();
        state.restarted_superstep == Some(state.superstep)
    }

    /// Start a manual restart at `superstep` on the current attempt
    pub fn restore(&self, superstep: u64) {
        let mut state = self.state.lock();
        state.superstep = superstep;
        state.restarted_superstep = Some(superstep);
        standard::CURRENT_SUPERSTEP.set(superstep as i64);
        info!("Superstep tracker restored to superstep {}", superstep);
    }

    /// Move to a fresh attempt that resumes from `checkpoint`
    pub fn restart_at(&self, checkpoint: u64) -> u64 {
        let mut state = self.state.lock();
        state.application_attempt += 1;
        state.superstep = checkpoint;
        state.restarted_superstep = Some(checkpoint);
        state.table = VertexRangeTable::new();
        state.table_superstep = None;
        standard::APPLICATION_ATTEMPT.set(state.application_attempt as i64);
        standard::CURRENT_SUPERSTEP.set(checkpoint as i64);
        info!(
            "Restarting at superstep {} on attempt {}",
            checkpoint, state.application_attempt
        );
        state.application_attempt
    }

    /// Advance to the next superstep
    pub fn advance(&self) -> u64 {
        let mut state = self.state.lock();
        state.superstep += 1;
        standard::CURRENT_SUPERSTEP.set(state.superstep as i64);
        debug!("Advanced to superstep {}", state.superstep);
        state.superstep
    }

    /// Replace the range table after an assignment for `superstep`
    pub fn install_table(&self, superstep: u64, table: VertexRangeTable) {
        let mut state = self.state.lock();
        state.table = table;
        state.table_superstep = Some(superstep);
    }

    /// Copy of the table and the superstep it was installed for
    pub fn table(&self) -> (Option<u64>, VertexRangeTable) {
        let state = self.state.lock();
        (state.table_superstep, state.table.clone())
    }

    /// Decide whether a deleted healthy registration is a failure.
    ///
    /// Registrations from older supersteps or other attempts are ignored.
    /// Otherwise the loss matters if the worker owns or previously owned a
    /// range in the current table.
    pub fn is_worker_failure(&self, attempt: u64, superstep: u64, worker_id: &str) -> bool {
        let state = self.state.lock();
        if attempt != state.application_attempt || superstep < state.superstep {
            return false;
        }
        state.table.involves(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::range::tests::range;

    #[test]
    fn test_restart_bumps_attempt() {
        let tracker = SuperstepTracker::new();
        tracker.advance();
        tracker.advance();
        assert_eq!(tracker.position(), (0, 2));

        assert_eq!(tracker.restart_at(1), 1);
        assert_eq!(tracker.position(), (1, 1));
        assert!(tracker.is_restart_superstep());
        tracker.advance();
        assert!(!tracker.is_restart_superstep());
    }

    #[test]
    fn test_worker_failure_filter() {
        let tracker = SuperstepTracker::new();
        for _ in 0..5 {
            tracker.advance();
        }
        let table = VertexRangeTable::from_ordered(vec![range(9, "a_0"), range(19, "b_1")]).unwrap();
        tracker.install_table(5, table);

        assert!(tracker.is_worker_failure(0, 5, "a_0"));
        assert!(!tracker.is_worker_failure(0, 4, "a_0"));
        assert!(!tracker.is_worker_failure(1, 5, "a_0"));
        assert!(!tracker.is_worker_failure(0, 5, "z_9"));
    }
}
