//! # Query Identifiers
//!
//! Every execution the coordinator tracks is keyed by a [`QueryId`]. Ids are
//! issued by a [`QidAllocator`]; they start at 1, only ever grow, and are
//! never reused within one allocator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one execution. A restarted query gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub u64);

impl QueryId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for QueryId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lock-free monotonically increasing id source.
#[derive(Debug)]
pub struct QidAllocator {
    next: AtomicU64,
}

impl QidAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Allocator whose first id is `first`. Used when ids below `first`
    /// were handed out by an earlier process.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> QueryId {
        QueryId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for QidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_one_and_increments() {
        let qids = QidAllocator::new();
        assert_eq!(qids.next_id(), QueryId(1));
        assert_eq!(qids.next_id(), QueryId(2));
        assert_eq!(qids.next_id(), QueryId(3));
    }

    #[test]
    fn test_concurrent_callers_never_share_an_id() {
        let qids = Arc::new(QidAllocator::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let qids = qids.clone();
                std::thread::spawn(move || (0..500).map(|_| qids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for w in workers {
            for id in w.join().unwrap() {
                assert!(seen.insert(id), "duplicate qid {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(qids.next_id(), QueryId(4001));
    }

    #[test]
    fn test_serializes_as_bare_number() {
        assert_eq!(serde_json::to_string(&QueryId(42)).unwrap(), "42");
        let back: QueryId = serde_json::from_str("7").unwrap();
        assert_eq!(back, QueryId(7));
    }
}
