//! # Query Model
//!
//! Parsed query input and the response shape the coordinator delivers.
//! Filter trees and pipeline stages are opaque here: they are produced by a
//! dialect parser and only interpreted by the execution engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sl_core::{BucketHolder, Granularity, QueryType, TimeRange};

/// Boolean filter tree as produced by a parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterTree(pub Value);

/// Ordered aggregation stages plus the result shape they produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub qtype: QueryType,
    #[serde(default)]
    pub stages: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub filter: FilterTree,
    #[serde(default)]
    pub pipeline: Pipeline,
}

fn default_size_limit() -> u64 {
    100
}

/// Per-query parameters shared by the primary and companion executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,
    #[serde(default)]
    pub scroll_from: u64,
    #[serde(default)]
    pub org_id: u64,
    #[serde(default)]
    pub raw_query: String,
    #[serde(default)]
    pub include_nulls: bool,
    pub time_range: TimeRange,
    /// Explicit histogram bucket width; resolved from `time_range` if absent.
    #[serde(default)]
    pub granularity: Option<Granularity>,
}

impl QueryContext {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            size_limit: default_size_limit(),
            scroll_from: 0,
            org_id: 0,
            raw_query: String::new(),
            include_nulls: false,
            time_range,
            granularity: None,
        }
    }

    pub fn resolved_granularity(&self) -> Granularity {
        self.granularity
            .unwrap_or_else(|| Granularity::for_range(&self.time_range))
    }
}

/// Final payload of one execution. The primary's payload carries the
/// reconciled companion histogram under `timechart_complete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryResponse {
    pub qtype: QueryType,
    pub hits: Vec<Value>,
    pub total_matched: u64,
    pub can_scroll_more: bool,
    pub measure_functions: Vec<String>,
    pub group_by_cols: Vec<String>,
    pub measure_results: Vec<BucketHolder>,
    pub bucket_count: usize,
    pub columns_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timechart_complete: Option<Box<QueryResponse>>,
}
