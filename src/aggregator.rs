//! Aggregator merging
//!
//! Workers report partial aggregator values with their finished report; the
//! master folds them into one value per name and publishes the merged list
//! for the next superstep to read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordination::records::WorkerFinishedReport;
use crate::coordination::{self, CoordinationClient, CoordinationPaths, CreateMode};
use crate::error::{BspError, Result};

/// Reduction applied to an aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorKind {
    LongSum,
    LongMin,
    LongMax,
    DoubleSum,
    DoubleMin,
    DoubleMax,
    BooleanAnd,
    BooleanOr,
}

/// Value carried by an aggregator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorValue {
    Long(i64),
    Double(f64),
    Boolean(bool),
}

impl AggregatorKind {
    /// Combine two values; the operation is associative and commutative
    pub fn combine(self, a: AggregatorValue, b: AggregatorValue) -> Option<AggregatorValue> {
        use AggregatorKind::*;
        use AggregatorValue::*;
        let merged = match (self, a, b) {
            (LongSum, Long(x), Long(y)) => Long(x.wrapping_add(y)),
            (LongMin, Long(x), Long(y)) => Long(x.min(y)),
            (LongMax, Long(x), Long(y)) => Long(x.max(y)),
            (DoubleSum, Double(x), Double(y)) => Double(x + y),
            (DoubleMin, Double(x), Double(y)) => Double(x.min(y)),
            (DoubleMax, Double(x), Double(y)) => Double(x.max(y)),
            (BooleanAnd, Boolean(x), Boolean(y)) => Boolean(x && y),
            (BooleanOr, Boolean(x), Boolean(y)) => Boolean(x || y),
            _ => return None,
        };
        Some(merged)
    }

    /// True if `value` is of the type this kind reduces over
    pub fn accepts(self, value: &AggregatorValue) -> bool {
        use AggregatorKind::*;
        matches!(
            (self, value),
            (LongSum | LongMin | LongMax, AggregatorValue::Long(_))
                | (DoubleSum | DoubleMin | DoubleMax, AggregatorValue::Double(_))
                | (BooleanAnd | BooleanOr, AggregatorValue::Boolean(_))
        )
    }
}

/// Named aggregator value as exchanged with workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorEntry {
    pub name: String,
    pub kind: AggregatorKind,
    pub value: AggregatorValue,
}

impl AggregatorEntry {
    pub fn new(name: impl Into<String>, kind: AggregatorKind, value: AggregatorValue) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
        }
    }
}

/// Fold of many partial aggregator reports
#[derive(Debug, Default)]
pub struct AggregatorMerger {
    merged: BTreeMap<String, AggregatorEntry>,
}

impl AggregatorMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker's entries; first sight of a name seeds it
    pub fn absorb(&mut self, entries: &[AggregatorEntry]) -> Result<()> {
        for entry in entries {
            if !entry.kind.accepts(&entry.value) {
                return Err(BspError::ProtocolViolation {
                    reason: format!(
                        "aggregator '{}' of kind {:?} carries {:?}",
                        entry.name, entry.kind, entry.value
                    ),
                });
            }
            match self.merged.get_mut(&entry.name) {
                None => {
                    debug!("absorb: seeding aggregator {}", entry.name);
                    self.merged.insert(entry.name.clone(), entry.clone());
                }
                Some(current) => {
                    if current.kind != entry.kind {
                        return Err(BspError::ProtocolViolation {
                            reason: format!(
                                "aggregator '{}' reported as {:?} and {:?}",
                                entry.name, current.kind, entry.kind
                            ),
                        });
                    }
                    current.value = current
                        .kind
                        .combine(current.value, entry.value)
                        .ok_or_else(|| BspError::ProtocolViolation {
                            reason: format!("aggregator '{}' has mismatched values", entry.name),
                        })?;
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Merged entries sorted by name
    pub fn into_entries(self) -> Vec<AggregatorEntry> {
        self.merged.into_values().collect()
    }
}

/// Serialize merged entries as stored in `merged-aggregators`
pub fn encode_entries(entries: &[AggregatorEntry]) -> Result<Vec<u8>> {
    serde_json::to_vec(entries).map_err(|e| BspError::Internal {
        message: format!("failed to encode aggregators: {}", e),
    })
}

/// Decode the merged list; an empty buffer means no aggregators
pub fn decode_entries(path: &str, data: &[u8]) -> Result<Vec<AggregatorEntry>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    coordination::decode_json(path, data)
}

/// Merge every worker's aggregator values for a superstep and publish them.
///
/// Superstep 0 has no aggregators. Returns the merged entries (possibly empty).
pub async fn collect_and_merge(
    client: &dyn CoordinationClient,
    paths: &CoordinationPaths,
    attempt: u64,
    superstep: u64,
) -> Result<Vec<AggregatorEntry>> {
    if superstep == 0 {
        return Ok(Vec::new());
    }
    let finished_dir = paths.worker_finished_dir(attempt, superstep);
    let reporters = client.get_children(&finished_dir, false).await?;

    let mut merger = AggregatorMerger::new();
    for reporter in &reporters {
        let path = coordination::join(&finished_dir, reporter);
        let report: WorkerFinishedReport = coordination::read_json(client, &path).await?;
        merger.absorb(&report.aggregators)?;
    }

    if merger.is_empty() {
        debug!("collect_and_merge: no aggregators on superstep {}", superstep);
        return Ok(Vec::new());
    }

    let entries = merger.into_entries();
    let merged_path = paths.merged_aggregators(attempt, superstep);
    match client
        .create(&merged_path, encode_entries(&entries)?, CreateMode::Persistent, true)
        .await
    {
        Ok(_) => info!(
            "collect_and_merge: merged {} aggregators from {} workers on superstep {}",
            entries.len(),
            reporters.len(),
            superstep
        ),
        Err(BspError::NodeExists { .. }) => {
            warn!("collect_and_merge: {} already exists", merged_path)
        }
        Err(e) => return Err(e),
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn reports() -> Vec<Vec<AggregatorEntry>> {
        (0..12)
            .map(|w| {
                vec![
                    AggregatorEntry::new("sum", AggregatorKind::LongSum, AggregatorValue::Long(w)),
                    AggregatorEntry::new(
                        "min",
                        AggregatorKind::LongMin,
                        AggregatorValue::Long(100 - w * 3),
                    ),
                    AggregatorEntry::new(
                        "all_active",
                        AggregatorKind::BooleanAnd,
                        AggregatorValue::Boolean(w != 7),
                    ),
                    AggregatorEntry::new(
                        "peak",
                        AggregatorKind::DoubleMax,
                        AggregatorValue::Double(w as f64 * 0.5),
                    ),
                ]
            })
            .collect()
    }

    fn merge(order: &[Vec<AggregatorEntry>]) -> Vec<AggregatorEntry> {
        let mut merger = AggregatorMerger::new();
        for entries in order {
            merger.absorb(entries).unwrap();
        }
        merger.into_entries()
    }

    #[test]
    fn test_merge_is_order_independent() {
        let mut order = reports();
        let expected = merge(&order);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..20 {
            order.shuffle(&mut rng);
            assert_eq!(merge(&order), expected);
        }

        let by_name: BTreeMap<_, _> = expected.iter().map(|e| (e.name.as_str(), e.value)).collect();
        assert_eq!(by_name["sum"], AggregatorValue::Long(66));
        assert_eq!(by_name["min"], AggregatorValue::Long(67));
        assert_eq!(by_name["all_active"], AggregatorValue::Boolean(false));
        assert_eq!(by_name["peak"], AggregatorValue::Double(5.5));
    }

    #[test]
    fn test_entries_sorted_by_name() {
        let names: Vec<_> = merge(&reports()).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["all_active", "min", "peak", "sum"]);
    }

    #[test]
    fn test_kind_mismatch_is_protocol_error() {
        let mut merger = AggregatorMerger::new();
        merger
            .absorb(&[AggregatorEntry::new("x", AggregatorKind::LongSum, AggregatorValue::Long(1))])
            .unwrap();
        let err = merger
            .absorb(&[AggregatorEntry::new("x", AggregatorKind::LongMax, AggregatorValue::Long(1))])
            .unwrap_err();
        assert!(err.is_fatal());

        let wrong_type = AggregatorMerger::new().absorb(&[AggregatorEntry::new(
            "y",
            AggregatorKind::BooleanOr,
            AggregatorValue::Long(3),
        )]);
        assert!(wrong_type.is_err());
    }

    #[test]
    fn test_empty_buffer_decodes_to_nothing() {
        assert!(decode_entries("/m", &[]).unwrap().is_empty());
        let bytes = encode_entries(&merge(&reports())).unwrap();
        assert_eq!(decode_entries("/m", &bytes).unwrap().len(), 4);
    }
}
