//! # Query States
//!
//! The lifecycle a query execution moves through:
//!
//! ```text
//! WAITING -> READY -> RUNNING -> QUERY_UPDATE* -> COMPLETE
//! ```
//!
//! `ERROR`, `TIMEOUT`, `CANCELLED` and `QUERY_RESTART` may be reached from any
//! non-terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Waiting,
    Ready,
    Running,
    QueryUpdate,
    Complete,
    Error,
    Timeout,
    Cancelled,
    QueryRestart,
}

impl QueryState {
    /// States after which no further events are expected for an id.
    /// `Error` counts as terminal; a restart replaces the id rather than
    /// reviving it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Error | Self::Timeout | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::QueryUpdate => "QUERY_UPDATE",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::QueryRestart => "QUERY_RESTART",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the (at most two) multiplexed executions produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceIndex {
    Primary,
    Companion,
}

impl fmt::Display for SourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Companion => write!(f, "companion"),
        }
    }
}

/// Shape of the result a pipeline produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Whole-range aggregates without grouping.
    SegmentStats,
    /// Aggregates grouped by columns, including histograms.
    GroupBy,
    /// Matching records themselves.
    RawRecords,
    #[default]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = [
            QueryState::Waiting,
            QueryState::Ready,
            QueryState::Running,
            QueryState::QueryUpdate,
            QueryState::Complete,
            QueryState::Error,
            QueryState::Timeout,
            QueryState::Cancelled,
            QueryState::QueryRestart,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(
            terminal,
            vec![
                QueryState::Complete,
                QueryState::Error,
                QueryState::Timeout,
                QueryState::Cancelled
            ]
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&QueryState::QueryRestart).unwrap(),
            "\"QUERY_RESTART\""
        );
        assert_eq!(QueryState::QueryUpdate.to_string(), "QUERY_UPDATE");
        assert_eq!(
            serde_json::to_string(&QueryType::SegmentStats).unwrap(),
            "\"segment_stats\""
        );
    }
}
