//! # Execution Engine Seam
//!
//! The coordinator never evaluates filters itself. When an execution turns
//! `READY` the driver hands an [`ExecutionRun`] to the engine on a separate
//! task and turns the returned result into a `COMPLETE` or `ERROR` event.

use crate::error::ExecError;
use crate::event::{CancelFlag, ProgressSender};
use crate::query::{QueryContext, QueryResponse, QuerySpec};
use sl_core::QueryId;
use std::sync::Arc;

/// Everything one execution needs.
#[derive(Debug, Clone)]
pub struct ExecutionRun {
    pub qid: QueryId,
    /// Streaming delivery; the engine may publish progress.
    pub is_async: bool,
    pub spec: Arc<QuerySpec>,
    pub ctx: Arc<QueryContext>,
    pub size_limit: u64,
    pub progress: ProgressSender,
    /// Checked by the engine at its own check points.
    pub cancel: CancelFlag,
}

#[async_trait::async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, run: ExecutionRun) -> Result<QueryResponse, ExecError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted engine for lifecycle tests.

    use super::*;
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    /// What one call to `execute` does.
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Publish `updates`, sleep `delay` (ignoring cancellation), then
        /// return `response`.
        Succeed {
            updates: Vec<Value>,
            delay: Duration,
            response: QueryResponse,
        },
        Fail(ExecError),
        /// Wait for the cancel flag (or `max`), then fail.
        Hang { max: Duration },
    }

    impl Script {
        pub fn ok(response: QueryResponse) -> Self {
            Self::Succeed {
                updates: Vec::new(),
                delay: Duration::ZERO,
                response,
            }
        }

        pub fn ok_after(delay: Duration, response: QueryResponse) -> Self {
            Self::Succeed {
                updates: Vec::new(),
                delay,
                response,
            }
        }

        pub fn unavailable() -> Self {
            Self::Fail(ExecError::Unavailable {
                node: "worker-2".into(),
                reason: "connection refused".into(),
            })
        }

        pub fn hang() -> Self {
            Self::Hang {
                max: Duration::from_secs(3600),
            }
        }
    }

    /// Scripts are keyed by the first filter-tree string the engine sees,
    /// so primary and companion can be scripted separately. Each run pops
    /// the next script for its key; the last one repeats.
    #[derive(Default)]
    pub struct ScriptedEngine {
        scripts: Mutex<HashMap<String, VecDeque<Script>>>,
        pub runs: Mutex<Vec<(QueryId, String)>>,
    }

    impl ScriptedEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(self, key: &str, steps: Vec<Script>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(key.to_string(), steps.into());
            self
        }

        pub fn runs_for(&self, key: &str) -> Vec<QueryId> {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, k)| k == key)
                .map(|(q, _)| *q)
                .collect()
        }

        fn next(&self, key: &str) -> Option<Script> {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.get_mut(key)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    pub fn key_of(spec: &QuerySpec) -> String {
        spec.filter.0.as_str().unwrap_or_default().to_string()
    }

    #[async_trait::async_trait]
    impl ExecutionEngine for ScriptedEngine {
        async fn execute(&self, run: ExecutionRun) -> Result<QueryResponse, ExecError> {
            let key = key_of(&run.spec);
            self.runs.lock().unwrap().push((run.qid, key.clone()));
            match self.next(&key) {
                Some(Script::Succeed {
                    updates,
                    delay,
                    response,
                }) => {
                    for u in updates {
                        run.progress.send(u).await;
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(response)
                }
                Some(Script::Fail(e)) => Err(e),
                Some(Script::Hang { max }) => {
                    let deadline = tokio::time::Instant::now() + max;
                    while !run.cancel.is_cancelled() && tokio::time::Instant::now() < deadline {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(ExecError::Failed("gave up".into()))
                }
                None => Err(ExecError::Failed(format!("no script for {:?}", key))),
            }
        }
    }
}
