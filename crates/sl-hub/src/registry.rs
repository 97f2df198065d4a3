//! # Query Registry
//!
//! Process-wide table of live executions, keyed by [`QueryId`]. The driver
//! holds the registry explicitly (usually behind an `Arc`); nothing reaches
//! it through globals.
//!
//! A registered execution gets two helper tasks:
//!
//! - **admission** posts `WAITING`, waits for one of `max_running_queries`
//!   slots, then posts `READY` and `RUNNING`;
//! - **watchdog** (when a query timeout is configured) posts `TIMEOUT` and
//!   raises the cancel flag if the execution is still registered when the
//!   timeout expires.
//!
//! [`QueryRegistry::delete`] is idempotent: it releases the slot, disarms
//! both tasks and raises the cancel flag so an orphaned execution stops.

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::event::{CancelFlag, StateChange, StateRx, StateTx, StateUpdate};
use crate::query::{QueryContext, QuerySpec};
use serde::Serialize;
use sl_core::{QidAllocator, QueryId, QueryState, QueryType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;

struct Entry {
    coordinator: bool,
    qtype: QueryType,
    cancel: CancelFlag,
    tx: StateTx,
    registered_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    tasks: Vec<JoinHandle<()>>,
}

/// Snapshot of a registered execution.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActiveQuery {
    pub qid: QueryId,
    pub qtype: QueryType,
    pub coordinator: bool,
    /// Holds a running slot.
    pub admitted: bool,
    pub cancelled: bool,
    pub age_ms: u64,
}

pub struct QueryRegistry {
    entries: Arc<RwLock<HashMap<QueryId, Entry>>>,
    qids: QidAllocator,
    slots: Arc<Semaphore>,
    config: CoordinatorConfig,
}

impl QueryRegistry {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            qids: QidAllocator::new(),
            slots: Arc::new(Semaphore::new(config.max_running_queries.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn next_qid(&self) -> QueryId {
        self.qids.next_id()
    }

    /// Register `qid` and open its state stream. The stream's first event
    /// is `WAITING`.
    pub async fn start(
        &self,
        qid: QueryId,
        is_async: bool,
        spec: Arc<QuerySpec>,
        ctx: Arc<QueryContext>,
        coordinator: bool,
    ) -> Result<(QueryExecutionHandle, StateRx), CoordinatorError> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let handle = self
            .start_on_channel(qid, is_async, spec, ctx, coordinator, tx)
            .await?;
        Ok((handle, rx))
    }

    /// Register `qid` on an existing state stream. Restarts use this so the
    /// driver keeps reading the same channel.
    async fn start_on_channel(
        &self,
        qid: QueryId,
        is_async: bool,
        spec: Arc<QuerySpec>,
        ctx: Arc<QueryContext>,
        coordinator: bool,
        tx: StateTx,
    ) -> Result<QueryExecutionHandle, CoordinatorError> {
        let qtype = spec.pipeline.qtype;
        let cancel = CancelFlag::default();
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&qid) {
                return Err(CoordinatorError::DuplicateQuery(qid));
            }
            // Spawned under the write lock so neither task can observe the
            // table before this entry is in it.
            let mut tasks = vec![self.spawn_admission(qid, tx.clone())];
            if let Some(timeout) = self.config.query_timeout() {
                tasks.push(self.spawn_watchdog(qid, timeout));
            }
            entries.insert(
                qid,
                Entry {
                    coordinator,
                    qtype,
                    cancel: cancel.clone(),
                    tx: tx.clone(),
                    registered_at: Instant::now(),
                    permit: None,
                    tasks,
                },
            );
        }
        tracing::info!(
            "qid={}, registered {:?} query, coordinator={}",
            qid,
            qtype,
            coordinator
        );

        Ok(QueryExecutionHandle {
            qid,
            coordinator,
            qtype,
            latest_state: QueryState::Waiting,
            is_async,
            spec,
            ctx,
            tx,
            cancel,
        })
    }

    fn spawn_admission(&self, qid: QueryId, tx: StateTx) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let slots = self.slots.clone();
        tokio::spawn(async move {
            if tx
                .send(StateUpdate::new(qid, StateChange::Waiting))
                .await
                .is_err()
            {
                return;
            }
            let Ok(permit) = slots.acquire_owned().await else {
                return;
            };
            {
                let mut entries = entries.write().await;
                match entries.get_mut(&qid) {
                    Some(entry) if !entry.cancel.is_cancelled() => entry.permit = Some(permit),
                    _ => return,
                }
            }
            for change in [StateChange::Ready, StateChange::Running] {
                if tx.send(StateUpdate::new(qid, change)).await.is_err() {
                    return;
                }
            }
        })
    }

    fn spawn_watchdog(&self, qid: QueryId, timeout: Duration) -> JoinHandle<()> {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let target = {
                let entries = entries.read().await;
                entries.get(&qid).map(|e| (e.tx.clone(), e.cancel.clone()))
            };
            if let Some((tx, cancel)) = target {
                tracing::warn!("qid={}, timed out after {}s", qid, timeout.as_secs());
                let _ = tx.send(StateUpdate::new(qid, StateChange::Timeout)).await;
                cancel.cancel();
            }
        })
    }

    pub async fn lookup(&self, qid: QueryId) -> Option<ActiveQuery> {
        let entries = self.entries.read().await;
        entries.get(&qid).map(|e| snapshot(qid, e))
    }

    pub async fn contains(&self, qid: QueryId) -> bool {
        self.entries.read().await.contains_key(&qid)
    }

    /// Returns whether this call removed the entry. Later calls, and calls
    /// racing the effective one, return false.
    pub async fn delete(&self, qid: QueryId) -> bool {
        let removed = self.entries.write().await.remove(&qid);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                for task in &entry.tasks {
                    task.abort();
                }
                tracing::info!("qid={}, deleted", qid);
                true
            }
            None => false,
        }
    }

    pub async fn type_of(&self, qid: QueryId) -> Option<QueryType> {
        self.entries.read().await.get(&qid).map(|e| e.qtype)
    }

    /// Raise the cancel flag and post `CANCELLED` on the query's stream.
    /// Unknown or already cancelled queries are left alone.
    pub async fn cancel(&self, qid: QueryId) -> bool {
        let tx = {
            let entries = self.entries.read().await;
            match entries.get(&qid) {
                Some(e) if e.cancel.cancel() => e.tx.clone(),
                _ => return false,
            }
        };
        tracing::info!("qid={}, cancel requested", qid);
        // The driver may be the stream's only reader and may be the caller,
        // so the post must not be awaited here.
        tokio::spawn(async move {
            let _ = tx
                .send(StateUpdate::new(qid, StateChange::Cancelled))
                .await;
        });
        true
    }

    /// Post `QUERY_RESTART` to every registered query, e.g. after cluster
    /// membership changed. Returns how many were notified.
    pub async fn restart_all(&self) -> usize {
        let targets: Vec<(QueryId, StateTx)> = {
            let entries = self.entries.read().await;
            entries.iter().map(|(q, e)| (*q, e.tx.clone())).collect()
        };
        tracing::info!("Restarting {} running queries", targets.len());
        let count = targets.len();
        for (qid, tx) in targets {
            tokio::spawn(async move {
                let _ = tx.send(StateUpdate::new(qid, StateChange::Restart)).await;
            });
        }
        count
    }

    pub async fn active(&self) -> Vec<ActiveQuery> {
        let entries = self.entries.read().await;
        let mut list: Vec<_> = entries.iter().map(|(q, e)| snapshot(*q, e)).collect();
        list.sort_by_key(|a| a.qid);
        list
    }
}

fn snapshot(qid: QueryId, e: &Entry) -> ActiveQuery {
    ActiveQuery {
        qid,
        qtype: e.qtype,
        coordinator: e.coordinator,
        admitted: e.permit.is_some(),
        cancelled: e.cancel.is_cancelled(),
        age_ms: e.registered_at.elapsed().as_millis() as u64,
    }
}

// =============================================================================
// Execution Handle
// =============================================================================

/// The driver's view of one execution. Owned exclusively by the driver;
/// `latest_state` has no other writer.
#[derive(Debug)]
pub struct QueryExecutionHandle {
    pub qid: QueryId,
    pub coordinator: bool,
    /// Cached at registration so responses can be annotated after deletion.
    pub qtype: QueryType,
    pub latest_state: QueryState,
    pub is_async: bool,
    pub spec: Arc<QuerySpec>,
    pub ctx: Arc<QueryContext>,
    pub tx: StateTx,
    pub cancel: CancelFlag,
}

impl QueryExecutionHandle {
    /// Supersede this execution with a fresh one under a new id on the same
    /// state stream. The old id is removed from `registry`; events still in
    /// flight for it become stale.
    pub async fn restart(
        &self,
        registry: &QueryRegistry,
    ) -> Result<QueryExecutionHandle, CoordinatorError> {
        if !self.coordinator {
            return Err(CoordinatorError::RestartRejected {
                qid: self.qid,
                reason: "not a coordinator execution",
            });
        }
        if self.cancel.is_cancelled() {
            return Err(CoordinatorError::RestartRejected {
                qid: self.qid,
                reason: "query was cancelled",
            });
        }
        if self.tx.is_closed() {
            return Err(CoordinatorError::RestartRejected {
                qid: self.qid,
                reason: "state stream has no reader",
            });
        }

        registry.delete(self.qid).await;
        let qid = registry.next_qid();
        let next = registry
            .start_on_channel(
                qid,
                self.is_async,
                self.spec.clone(),
                self.ctx.clone(),
                self.coordinator,
                self.tx.clone(),
            )
            .await?;
        tracing::info!("qid={}, restarted as qid={}", self.qid, qid);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_core::TimeRange;

    fn registry(config: CoordinatorConfig) -> QueryRegistry {
        QueryRegistry::new(config)
    }

    fn spec(qtype: QueryType) -> Arc<QuerySpec> {
        let mut spec = QuerySpec::default();
        spec.pipeline.qtype = qtype;
        Arc::new(spec)
    }

    fn ctx() -> Arc<QueryContext> {
        Arc::new(QueryContext::new(TimeRange::new(0, 60_000).unwrap()))
    }

    async fn next_state(rx: &mut StateRx) -> (QueryId, QueryState) {
        let u = rx.recv().await.unwrap();
        (u.qid, u.change.state())
    }

    #[tokio::test]
    async fn test_start_emits_waiting_ready_running() {
        let reg = registry(CoordinatorConfig::default());
        let qid = reg.next_qid();
        let (handle, mut rx) = reg
            .start(qid, false, spec(QueryType::GroupBy), ctx(), true)
            .await
            .unwrap();

        assert_eq!(handle.latest_state, QueryState::Waiting);
        assert_eq!(next_state(&mut rx).await, (qid, QueryState::Waiting));
        assert_eq!(next_state(&mut rx).await, (qid, QueryState::Ready));
        assert_eq!(next_state(&mut rx).await, (qid, QueryState::Running));
        assert_eq!(reg.type_of(qid).await, Some(QueryType::GroupBy));
        assert!(reg.lookup(qid).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_duplicate_start_fails() {
        let reg = registry(CoordinatorConfig::default());
        let qid = reg.next_qid();
        let _first = reg.start(qid, false, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        let second = reg.start(qid, false, spec(QueryType::RawRecords), ctx(), true).await;
        assert!(matches!(second, Err(CoordinatorError::DuplicateQuery(q)) if q == qid));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let reg = Arc::new(registry(CoordinatorConfig::default()));
        let qid = reg.next_qid();
        let (handle, _rx) = reg
            .start(qid, false, spec(QueryType::RawRecords), ctx(), true)
            .await
            .unwrap();

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.delete(qid).await })
            })
            .collect();
        let mut effective = 0;
        for r in racers {
            if r.await.unwrap() {
                effective += 1;
            }
        }
        assert_eq!(effective, 1);
        assert!(reg.lookup(qid).await.is_none());
        assert!(!reg.delete(qid).await);
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_admission_limit_holds_queries_waiting() {
        let reg = registry(CoordinatorConfig {
            max_running_queries: 1,
            ..Default::default()
        });
        let first = reg.next_qid();
        let second = reg.next_qid();
        let (_h1, mut rx1) = reg.start(first, false, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        let (_h2, mut rx2) = reg.start(second, false, spec(QueryType::RawRecords), ctx(), true).await.unwrap();

        for want in [QueryState::Waiting, QueryState::Ready, QueryState::Running] {
            assert_eq!(next_state(&mut rx1).await.1, want);
        }
        assert_eq!(next_state(&mut rx2).await.1, QueryState::Waiting);
        let held = tokio::time::timeout(Duration::from_millis(50), rx2.recv()).await;
        assert!(held.is_err(), "second query admitted past the limit");

        reg.delete(first).await;
        assert_eq!(next_state(&mut rx2).await.1, QueryState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_posts_cancelled_once() {
        let reg = registry(CoordinatorConfig::default());
        let qid = reg.next_qid();
        let (handle, mut rx) = reg.start(qid, true, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        assert!(reg.cancel(qid).await);
        assert!(!reg.cancel(qid).await);
        assert!(!reg.cancel(QueryId(999)).await);
        assert_eq!(next_state(&mut rx).await, (qid, QueryState::Cancelled));
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_posts_timeout() {
        let reg = registry(CoordinatorConfig {
            query_timeout_secs: 30,
            ..Default::default()
        });
        let qid = reg.next_qid();
        let (handle, mut rx) = reg.start(qid, true, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(next_state(&mut rx).await, (qid, QueryState::Timeout));
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_disarms_watchdog() {
        let reg = registry(CoordinatorConfig {
            query_timeout_secs: 5,
            ..Default::default()
        });
        let qid = reg.next_qid();
        let (handle, mut rx) = reg.start(qid, false, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        reg.delete(qid).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        drop(handle);
        // No TIMEOUT, and no sender left once the entry and handle are gone.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_swaps_id_on_same_stream() {
        let reg = registry(CoordinatorConfig::default());
        let old = reg.next_qid();
        let (handle, mut rx) = reg.start(old, true, spec(QueryType::GroupBy), ctx(), true).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let next = handle.restart(&reg).await.unwrap();
        assert_ne!(next.qid, old);
        assert!(next.qid > old);
        assert!(!reg.contains(old).await);
        assert!(reg.contains(next.qid).await);
        assert_eq!(next.qtype, QueryType::GroupBy);
        assert_eq!(next_state(&mut rx).await, (next.qid, QueryState::Waiting));
    }

    #[tokio::test]
    async fn test_restart_rejected_for_cancelled_or_non_coordinator() {
        let reg = registry(CoordinatorConfig::default());
        let qid = reg.next_qid();
        let (handle, _rx) = reg.start(qid, true, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        reg.cancel(qid).await;
        assert!(matches!(
            handle.restart(&reg).await,
            Err(CoordinatorError::RestartRejected { .. })
        ));

        let child = reg.next_qid();
        let (handle, _rx) = reg.start(child, true, spec(QueryType::RawRecords), ctx(), false).await.unwrap();
        assert!(matches!(
            handle.restart(&reg).await,
            Err(CoordinatorError::RestartRejected { .. })
        ));
        assert!(reg.contains(child).await);
    }

    #[tokio::test]
    async fn test_restart_all_reaches_every_query() {
        let reg = registry(CoordinatorConfig::default());
        let a = reg.next_qid();
        let b = reg.next_qid();
        let (_ha, mut rxa) = reg.start(a, true, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        let (_hb, mut rxb) = reg.start(b, true, spec(QueryType::RawRecords), ctx(), true).await.unwrap();
        for _ in 0..3 {
            rxa.recv().await.unwrap();
            rxb.recv().await.unwrap();
        }
        assert_eq!(reg.restart_all().await, 2);
        assert_eq!(next_state(&mut rxa).await, (a, QueryState::QueryRestart));
        assert_eq!(next_state(&mut rxb).await, (b, QueryState::QueryRestart));
        assert_eq!(reg.active().await.len(), 2);
    }
}
