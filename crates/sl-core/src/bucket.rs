//! # Time-Bucket Reconciliation
//!
//! Execution reports a histogram sparsely: only buckets that saw data are
//! present. [`reconcile`] expands the query's range into every expected
//! bucket at the resolved granularity, zero-fills each configured measure,
//! and then lays the computed buckets over that grid.

use crate::time::{Granularity, TimeRange, TimeRangeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound on the dense grid. Resolved granularities stay in the
/// hundreds; only an explicit granularity far finer than the range gets
/// near it. One-second buckets fit about 23 days.
pub const MAX_DENSE_BUCKETS: usize = 2_000_000;

/// One histogram bucket. `bucket_key` is the bucket start in epoch
/// milliseconds, rendered as a decimal string.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketHolder {
    #[serde(default)]
    pub bucket_key: String,
    #[serde(default)]
    pub measure_values: BTreeMap<String, Value>,
}

impl BucketHolder {
    pub fn empty(start_ms: u64, measures: &[String]) -> Self {
        Self {
            bucket_key: start_ms.to_string(),
            measure_values: measures
                .iter()
                .map(|m| (m.clone(), Value::from(0)))
                .collect(),
        }
    }

    pub fn start_ms(&self) -> Result<u64, ReconcileError> {
        if self.bucket_key.trim().is_empty() {
            return Err(ReconcileError::MissingKey);
        }
        self.bucket_key
            .trim()
            .parse()
            .map_err(|_| ReconcileError::MalformedKey(self.bucket_key.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("bucket has no timestamp key")]
    MissingKey,
    #[error("bucket key {0:?} is not an epoch-millisecond timestamp")]
    MalformedKey(String),
    #[error("dense series would exceed {limit} buckets")]
    TooManyBuckets { limit: usize },
    #[error(transparent)]
    Range(#[from] TimeRangeError),
}

/// Every bucket start from the aligned start of `range` up to and including
/// `range.end_ms`.
pub fn bucket_starts(range: &TimeRange, granularity: &Granularity) -> Result<Vec<u64>, ReconcileError> {
    range.validate()?;
    let mut starts = Vec::new();
    let mut t = granularity.align(range.start_ms)?;
    while t <= range.end_ms {
        if starts.len() == MAX_DENSE_BUCKETS {
            return Err(ReconcileError::TooManyBuckets {
                limit: MAX_DENSE_BUCKETS,
            });
        }
        starts.push(t);
        t = granularity.advance(t)?;
    }
    Ok(starts)
}

/// Densify `sparse` over `range`.
///
/// The result has exactly one bucket per step of [`bucket_starts`], in time
/// order. A sparse bucket overwrites the measures of the grid bucket that
/// encloses its key; keys before the first or after the last bucket clamp
/// to it. Measures a sparse bucket does not carry keep their zero default.
/// Reconciling an already dense series returns it unchanged.
pub fn reconcile(
    sparse: &[BucketHolder],
    measures: &[String],
    range: &TimeRange,
    granularity: &Granularity,
) -> Result<Vec<BucketHolder>, ReconcileError> {
    let starts = bucket_starts(range, granularity)?;
    let mut dense: Vec<BucketHolder> = starts
        .iter()
        .map(|&s| BucketHolder::empty(s, measures))
        .collect();

    for bucket in sparse {
        let aligned = granularity.align(bucket.start_ms()?)?;
        let idx = starts.partition_point(|&s| s <= aligned).saturating_sub(1);
        // `starts` is never empty: the aligned start is <= range.start < range.end.
        if let Some(slot) = dense.get_mut(idx) {
            for (name, value) in &bucket.measure_values {
                slot.measure_values.insert(name.clone(), value.clone());
            }
        }
    }

    Ok(dense)
}
