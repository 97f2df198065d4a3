//! # State Stream Multiplexer
//!
//! Fans the primary execution's state stream and, when a companion
//! histogram query runs alongside it, the companion's stream into one
//! stream of [`StateEvent`]s tagged with their [`SourceIndex`].
//!
//! Order is preserved per source only. The merged stream closes once both
//! inputs have closed, or as soon as its consumer goes away.

use crate::event::{StateEvent, StateRx, StateUpdate};
use sl_core::SourceIndex;
use tokio::sync::mpsc;

pub struct StateMultiplexer {
    primary: StateRx,
    companion: Option<StateRx>,
    capacity: usize,
}

impl StateMultiplexer {
    pub fn new(primary: StateRx, companion: Option<StateRx>) -> Self {
        Self {
            primary,
            companion,
            capacity: 16,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Start forwarding on a background task and return the merged stream.
    pub fn spawn(self) -> mpsc::Receiver<StateEvent> {
        let (out, merged) = mpsc::channel(self.capacity);
        tokio::spawn(self.run(out));
        merged
    }

    async fn run(mut self, out: mpsc::Sender<StateEvent>) {
        let mut primary_open = true;
        let mut companion_open = self.companion.is_some();

        while primary_open || companion_open {
            let (source, update) = tokio::select! {
                msg = self.primary.recv(), if primary_open => match msg {
                    Some(u) => (SourceIndex::Primary, u),
                    None => {
                        primary_open = false;
                        continue;
                    }
                },
                msg = recv_companion(&mut self.companion), if companion_open => match msg {
                    Some(u) => (SourceIndex::Companion, u),
                    None => {
                        companion_open = false;
                        continue;
                    }
                },
                _ = out.closed() => break,
            };
            if out.send(tag(source, update)).await.is_err() {
                break;
            }
        }
        tracing::debug!("State multiplexer closed");
    }
}

async fn recv_companion(rx: &mut Option<StateRx>) -> Option<StateUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

fn tag(source: SourceIndex, update: StateUpdate) -> StateEvent {
    StateEvent {
        qid: update.qid,
        source,
        change: update.change,
    }
}
