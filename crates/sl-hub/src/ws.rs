//! # Streaming I/O Adapter
//!
//! While the driver writes frames to a websocket, a [`SignalReader`] task
//! reads the client's control frames and turns them into
//! [`ClientSignal`]s:
//!
//! - `{"state": "cancel"}` becomes [`ClientSignal::Cancel`];
//! - `{"state": "exit"}` becomes [`ClientSignal::Exit`] and stops the reader;
//! - a read failure, an undecodable frame or a disconnect becomes
//!   [`ClientSignal::Cancel`] so the driver never waits on a dead client.
//!
//! [`SignalReader::finish`] stops the reader once the driver is done.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitStream, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSignal {
    Cancel,
    Exit,
}

pub struct SignalReader {
    signals: mpsc::Receiver<ClientSignal>,
    exit: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SignalReader {
    /// Read decoded client frames from `frames` on a background task.
    pub fn spawn<St, E>(mut frames: St) -> Self
    where
        St: Stream<Item = Result<Value, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (tx, signals) = mpsc::channel(4);
        let (exit, mut exit_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = &mut exit_rx => break,
                    frame = frames.next() => frame,
                };
                let signal = match frame {
                    Some(Ok(v)) => match v.get("state").and_then(Value::as_str) {
                        Some("cancel") => ClientSignal::Cancel,
                        Some("exit") => ClientSignal::Exit,
                        other => {
                            tracing::debug!("Ignoring client frame with state {:?}", other);
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!("Client read failed, cancelling: {}", e);
                        let _ = tx.send(ClientSignal::Cancel).await;
                        break;
                    }
                    None => {
                        tracing::info!("Client disconnected, cancelling");
                        let _ = tx.send(ClientSignal::Cancel).await;
                        break;
                    }
                };
                if tx.send(signal).await.is_err() || signal == ClientSignal::Exit {
                    break;
                }
            }
        });

        Self {
            signals,
            exit: Some(exit),
            task,
        }
    }

    /// Reader over the receiving half of a websocket.
    pub fn from_websocket(stream: SplitStream<WebSocket>) -> Self {
        let frames = stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()))
                }
                Ok(Message::Close(_)) => Some(Err("client sent close".to_string())),
                Ok(_) => None,
                Err(e) => Some(Err(e.to_string())),
            }
        });
        Self::spawn(Box::pin(frames))
    }

    /// Next signal; `None` once the reader has stopped and drained.
    pub async fn next_signal(&mut self) -> Option<ClientSignal> {
        self.signals.recv().await
    }

    /// Tell the reader to stop.
    pub fn finish(mut self) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(());
        }
        if !self.task.is_finished() {
            tracing::debug!("Signal reader stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    #[tokio::test]
    async fn test_cancel_frame_becomes_cancel() {
        let frames = stream::iter(vec![
            Ok::<_, String>(json!({"state": "ping"})),
            Ok(json!({"state": "cancel"})),
        ])
        .chain(stream::pending());
        let mut reader = SignalReader::spawn(Box::pin(frames));
        assert_eq!(reader.next_signal().await, Some(ClientSignal::Cancel));
        reader.finish();
    }

    #[tokio::test]
    async fn test_read_error_synthesizes_cancel() {
        let frames = stream::iter(vec![Err::<Value, _>("connection reset".to_string())]);
        let mut reader = SignalReader::spawn(Box::pin(frames));
        assert_eq!(reader.next_signal().await, Some(ClientSignal::Cancel));
        assert_eq!(reader.next_signal().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_synthesizes_cancel() {
        let frames = stream::iter(Vec::<Result<Value, String>>::new());
        let mut reader = SignalReader::spawn(Box::pin(frames));
        assert_eq!(reader.next_signal().await, Some(ClientSignal::Cancel));
    }

    #[tokio::test]
    async fn test_exit_stops_reader() {
        let frames = stream::iter(vec![
            Ok::<_, String>(json!({"state": "exit"})),
            Ok(json!({"state": "cancel"})),
        ]);
        let mut reader = SignalReader::spawn(Box::pin(frames));
        assert_eq!(reader.next_signal().await, Some(ClientSignal::Exit));
        assert_eq!(reader.next_signal().await, None);
    }

    #[tokio::test]
    async fn test_finish_stops_reader_without_signal() {
        let (tx, rx) = mpsc::channel::<Result<Value, String>>(1);
        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let reader = SignalReader::spawn(Box::pin(frames));
        reader.finish();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(tx.is_closed());
    }
}
