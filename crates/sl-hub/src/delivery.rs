//! # Delivery Strategies
//!
//! One lifecycle loop serves both delivery modes. What differs is where
//! progress and results go:
//!
//! | Event        | [`CollectDelivery`] (request/response) | [`StreamDelivery`] (websocket)          |
//! |--------------|----------------------------------------|-----------------------------------------|
//! | `RUNNING`    | dropped                                | `{state: "RUNNING", qid}`               |
//! | update       | dropped                                | payload, companion's under `timechartUpdate` |
//! | completion   | returned                               | payload + `{state: "COMPLETE", qid}`    |
//! | timeout      | `Err(Timeout)`                         | `{state: "TIMEOUT", qid, timeoutSeconds}` |
//! | cancellation | nothing                                | `{state: "CANCELLED", qid}`             |
//! | failure      | `Err(..)`                              | `{state: "error", message}`             |

use crate::error::CoordinatorError;
use crate::query::QueryResponse;
use crate::ws::{ClientSignal, SignalReader};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::{json, Value};
use sl_core::{QueryId, SourceIndex};
use thiserror::Error;
use tokio::sync::mpsc;

#[async_trait::async_trait]
pub trait Delivery: Send {
    fn is_streaming(&self) -> bool;

    /// Resolves when the client asked to cancel. Never resolves for
    /// deliveries without a client side-channel.
    async fn client_cancelled(&mut self);

    async fn running(&mut self, qid: QueryId, source: SourceIndex);

    async fn update(&mut self, qid: QueryId, source: SourceIndex, payload: Value);

    /// Deliver a final payload. Returns it when the caller collects results.
    async fn complete(&mut self, qid: QueryId, response: QueryResponse) -> Option<QueryResponse>;

    async fn timed_out(&mut self, qid: QueryId, timeout_secs: u64) -> Result<(), CoordinatorError>;

    async fn cancelled(&mut self, qid: QueryId);

    /// Report a terminal failure. Collecting deliveries hand it back as the
    /// error; streaming ones write it and succeed.
    async fn failed(&mut self, qid: QueryId, err: CoordinatorError) -> Result<(), CoordinatorError>;
}

// =============================================================================
// Request/response
// =============================================================================

#[derive(Debug, Default)]
pub struct CollectDelivery;

#[async_trait::async_trait]
impl Delivery for CollectDelivery {
    fn is_streaming(&self) -> bool {
        false
    }

    async fn client_cancelled(&mut self) {
        std::future::pending::<()>().await
    }

    async fn running(&mut self, _qid: QueryId, _source: SourceIndex) {}

    async fn update(&mut self, _qid: QueryId, _source: SourceIndex, _payload: Value) {}

    async fn complete(&mut self, _qid: QueryId, response: QueryResponse) -> Option<QueryResponse> {
        Some(response)
    }

    async fn timed_out(&mut self, qid: QueryId, timeout_secs: u64) -> Result<(), CoordinatorError> {
        Err(CoordinatorError::Timeout { qid, timeout_secs })
    }

    async fn cancelled(&mut self, _qid: QueryId) {}

    async fn failed(&mut self, _qid: QueryId, err: CoordinatorError) -> Result<(), CoordinatorError> {
        Err(err)
    }
}

// =============================================================================
// Streaming
// =============================================================================

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("client connection closed")]
    Closed,
    #[error("websocket write failed: {0}")]
    Transport(String),
}

/// Anything JSON frames can be written to.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Value) -> Result<(), FrameError>;
}

#[async_trait::async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: Value) -> Result<(), FrameError> {
        self.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| FrameError::Transport(e.to_string()))
    }
}

#[async_trait::async_trait]
impl FrameSink for mpsc::Sender<Value> {
    async fn send_frame(&mut self, frame: Value) -> Result<(), FrameError> {
        self.send(frame).await.map_err(|_| FrameError::Closed)
    }
}

pub struct StreamDelivery<S> {
    sink: S,
    signals: Option<SignalReader>,
}

impl<S: FrameSink> StreamDelivery<S> {
    pub fn new(sink: S, signals: Option<SignalReader>) -> Self {
        Self { sink, signals }
    }

    /// Stop the signal reader and give the sink back.
    pub fn finish(self) -> S {
        if let Some(reader) = self.signals {
            reader.finish();
        }
        self.sink
    }

    /// Report an error that happened before the lifecycle loop started.
    pub async fn send_error(&mut self, qid: QueryId, err: &CoordinatorError) {
        self.write(qid, error_frame(&err.to_string())).await;
    }

    async fn write(&mut self, qid: QueryId, frame: Value) {
        if let Err(e) = self.sink.send_frame(frame).await {
            tracing::error!("qid={}, failed to write frame: {}", qid, e);
        }
    }
}

pub fn running_frame(qid: QueryId) -> Value {
    json!({"state": "RUNNING", "qid": qid})
}

pub fn update_frame(source: SourceIndex, payload: Value) -> Value {
    match source {
        SourceIndex::Primary => payload,
        SourceIndex::Companion => json!({"timechartUpdate": payload}),
    }
}

pub fn complete_frame(qid: QueryId, response: &QueryResponse) -> Value {
    let mut frame = serde_json::to_value(response).unwrap_or_else(|_| json!({}));
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("state".into(), json!("COMPLETE"));
        obj.insert("qid".into(), json!(qid));
    }
    frame
}

pub fn timeout_frame(qid: QueryId, timeout_secs: u64) -> Value {
    json!({"state": "TIMEOUT", "qid": qid, "timeoutSeconds": timeout_secs})
}

pub fn cancel_frame(qid: QueryId) -> Value {
    json!({"state": "CANCELLED", "qid": qid})
}

pub fn error_frame(message: &str) -> Value {
    json!({"state": "error", "message": message})
}

#[async_trait::async_trait]
impl<S: FrameSink> Delivery for StreamDelivery<S> {
    fn is_streaming(&self) -> bool {
        true
    }

    async fn client_cancelled(&mut self) {
        loop {
            let Some(reader) = self.signals.as_mut() else {
                return std::future::pending::<()>().await;
            };
            match reader.next_signal().await {
                Some(ClientSignal::Cancel) => return,
                Some(ClientSignal::Exit) => continue,
                None => self.signals = None,
            }
        }
    }

    async fn running(&mut self, qid: QueryId, _source: SourceIndex) {
        self.write(qid, running_frame(qid)).await;
    }

    async fn update(&mut self, qid: QueryId, source: SourceIndex, payload: Value) {
        self.write(qid, update_frame(source, payload)).await;
    }

    async fn complete(&mut self, qid: QueryId, response: QueryResponse) -> Option<QueryResponse> {
        self.write(qid, complete_frame(qid, &response)).await;
        None
    }

    async fn timed_out(&mut self, qid: QueryId, timeout_secs: u64) -> Result<(), CoordinatorError> {
        self.write(qid, timeout_frame(qid, timeout_secs)).await;
        Ok(())
    }

    async fn cancelled(&mut self, qid: QueryId) {
        self.write(qid, cancel_frame(qid)).await;
    }

    async fn failed(&mut self, qid: QueryId, err: CoordinatorError) -> Result<(), CoordinatorError> {
        tracing::warn!("qid={}, query failed: {}", qid, err);
        self.write(qid, error_frame(&err.to_string())).await;
        Ok(())
    }
}
