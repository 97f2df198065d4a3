//! # State Events
//!
//! Every execution reports its lifecycle over a bounded channel of
//! [`StateUpdate`]s. The multiplexer tags them with their source and hands
//! the driver [`StateEvent`]s.

use crate::error::ExecError;
use crate::query::QueryResponse;
use serde_json::Value;
use sl_core::{QueryId, QueryState, SourceIndex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A state transition with the payload that belongs to it.
#[derive(Debug)]
pub enum StateChange {
    Waiting,
    Ready,
    Running,
    Update(Value),
    Complete(Box<QueryResponse>),
    Error(ExecError),
    Timeout,
    Cancelled,
    Restart,
}

impl StateChange {
    pub fn state(&self) -> QueryState {
        match self {
            Self::Waiting => QueryState::Waiting,
            Self::Ready => QueryState::Ready,
            Self::Running => QueryState::Running,
            Self::Update(_) => QueryState::QueryUpdate,
            Self::Complete(_) => QueryState::Complete,
            Self::Error(_) => QueryState::Error,
            Self::Timeout => QueryState::Timeout,
            Self::Cancelled => QueryState::Cancelled,
            Self::Restart => QueryState::QueryRestart,
        }
    }
}

#[derive(Debug)]
pub struct StateUpdate {
    pub qid: QueryId,
    pub change: StateChange,
}

impl StateUpdate {
    pub fn new(qid: QueryId, change: StateChange) -> Self {
        Self { qid, change }
    }
}

/// A [`StateUpdate`] tagged with the execution that produced it.
#[derive(Debug)]
pub struct StateEvent {
    pub qid: QueryId,
    pub source: SourceIndex,
    pub change: StateChange,
}

pub type StateTx = mpsc::Sender<StateUpdate>;
pub type StateRx = mpsc::Receiver<StateUpdate>;

/// Handed to an execution so it can publish `QUERY_UPDATE` payloads.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    qid: QueryId,
    tx: StateTx,
}

impl ProgressSender {
    pub fn new(qid: QueryId, tx: StateTx) -> Self {
        Self { qid, tx }
    }

    /// Returns false once nobody is listening any more.
    pub async fn send(&self, payload: Value) -> bool {
        self.tx
            .send(StateUpdate::new(self.qid, StateChange::Update(payload)))
            .await
            .is_ok()
    }
}

/// Cooperative cancellation flag shared with the execution.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Returns true if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_maps_to_state() {
        assert_eq!(StateChange::Update(json!({})).state(), QueryState::QueryUpdate);
        assert_eq!(StateChange::Restart.state(), QueryState::QueryRestart);
        assert_eq!(
            StateChange::Error(ExecError::Failed("x".into())).state(),
            QueryState::Error
        );
    }

    #[test]
    fn test_cancel_flag_flips_once() {
        let flag = CancelFlag::default();
        let shared = flag.clone();
        assert!(!shared.is_cancelled());
        assert!(flag.cancel());
        assert!(!shared.cancel());
        assert!(shared.is_cancelled());
    }

    #[tokio::test]
    async fn test_progress_sender() {
        let (tx, mut rx) = mpsc::channel(4);
        let progress = ProgressSender::new(QueryId(9), tx);
        assert!(progress.send(json!({"percent": 40})).await);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.qid, QueryId(9));
        assert!(matches!(update.change, StateChange::Update(ref v) if v["percent"] == 40));
        drop(rx);
        assert!(!progress.send(json!({})).await);
    }
}
