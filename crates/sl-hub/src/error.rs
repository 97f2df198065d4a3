//! # Errors
//!
//! [`ExecError`] is what the execution layer reports. [`CoordinatorError`]
//! is what callers of the coordinator see.

use sl_core::{QueryId, ReconcileError, TimeRangeError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The worker serving part of the query became unreachable. Coordinator
    /// executions restart instead of failing.
    #[error("remote node {node} unavailable: {reason}")]
    Unavailable { node: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl ExecError {
    pub fn is_rpc_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("qid={0} is already registered")]
    DuplicateQuery(QueryId),
    #[error("qid={qid}: {source}")]
    Execution {
        qid: QueryId,
        #[source]
        source: ExecError,
    },
    #[error("qid={qid}: restart rejected: {reason}")]
    RestartRejected { qid: QueryId, reason: &'static str },
    #[error("qid={qid}: no restart confirmation within {waited_ms}ms")]
    RestartTimeout { qid: QueryId, waited_ms: u64 },
    #[error("time-bucket reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("qid={qid}: query timed out after {timeout_secs}s")]
    Timeout { qid: QueryId, timeout_secs: u64 },
    #[error("invalid time range: {0}")]
    InvalidTimeRange(#[from] TimeRangeError),
    #[error("query state stream closed before a terminal state")]
    EventStreamClosed,
}

impl CoordinatorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
