//! # Query Lifecycle Driver
//!
//! [`Coordinator::run_query`] owns a query from registration to its single
//! terminal notification. It starts the primary execution (and the
//! companion histogram execution when one is requested), merges their state
//! streams and reacts to each event in turn:
//!
//! | State           | Reaction                                                   |
//! |-----------------|------------------------------------------------------------|
//! | `WAITING`       | nothing                                                    |
//! | `READY`         | launch that source's execution on its own task             |
//! | `RUNNING`       | progress notification                                      |
//! | `QUERY_UPDATE`  | forward the payload                                        |
//! | `COMPLETE`      | deregister the source; once all sources are complete, reconcile the histogram and deliver |
//! | `ERROR`         | restart if a coordinator lost its worker, otherwise fail   |
//! | `QUERY_RESTART` | restart that source under a new id                         |
//! | `TIMEOUT`       | deregister, report completion or timeout per source        |
//! | `CANCELLED`     | deregister, report cancellation per source                 |
//!
//! Events are handled one at a time. An event whose id is not the current
//! id of its source predates a restart and is dropped.

use crate::config::CoordinatorConfig;
use crate::delivery::{CollectDelivery, Delivery, FrameSink, StreamDelivery};
use crate::engine::{ExecutionEngine, ExecutionRun};
use crate::error::CoordinatorError;
use crate::event::{ProgressSender, StateChange, StateEvent, StateUpdate};
use crate::multiplexer::StateMultiplexer;
use crate::query::{QueryContext, QueryResponse, QuerySpec};
use crate::registry::{QueryExecutionHandle, QueryRegistry};
use crate::ws::SignalReader;
use sl_core::{reconcile, Granularity, QueryId, QueryState, QueryType, SourceIndex, TimeRange};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Coordinator {
    registry: Arc<QueryRegistry>,
    engine: Arc<dyn ExecutionEngine>,
}

/// A parsed query ready to run. `qid` should come from
/// [`QueryRegistry::next_qid`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub qid: QueryId,
    pub primary: QuerySpec,
    /// Histogram query to run alongside the primary.
    pub companion: Option<QuerySpec>,
    pub context: QueryContext,
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Final payload; only populated for collecting delivery.
    pub response: Option<QueryResponse>,
    /// A `TIMEOUT` was reported to a streaming client.
    pub timed_out: bool,
    pub time_range: TimeRange,
}

impl Coordinator {
    pub fn new(registry: Arc<QueryRegistry>, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { registry, engine }
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        self.registry.config()
    }

    /// Run to completion and return the payload.
    pub async fn run_sync(&self, request: RunRequest) -> Result<RunOutcome, CoordinatorError> {
        self.run_query(request, &mut CollectDelivery).await
    }

    /// Run to completion, writing every notification to `sink`. Failures
    /// after registration are written as error frames, not returned; earlier
    /// ones are written and returned.
    pub async fn run_streaming<S: FrameSink>(
        &self,
        request: RunRequest,
        sink: S,
        signals: Option<SignalReader>,
    ) -> Result<RunOutcome, CoordinatorError> {
        let qid = request.qid;
        let mut delivery = StreamDelivery::new(sink, signals);
        let result = self.run_query(request, &mut delivery).await;
        if let Err(e) = &result {
            delivery.send_error(qid, e).await;
        }
        delivery.finish();
        result
    }

    pub async fn run_query<D: Delivery>(
        &self,
        request: RunRequest,
        delivery: &mut D,
    ) -> Result<RunOutcome, CoordinatorError> {
        let RunRequest {
            qid,
            primary,
            companion,
            context,
        } = request;
        let time_range = context.time_range;
        let size_limit = context.size_limit;

        let max_scroll = self.config().max_scroll_from;
        if context.scroll_from > max_scroll {
            tracing::info!(
                "qid={}, scrollFrom {} is past {}, nothing more to return",
                qid,
                context.scroll_from,
                max_scroll
            );
            let response = QueryResponse {
                qtype: primary.pipeline.qtype,
                can_scroll_more: false,
                ..Default::default()
            };
            let response = delivery.complete(qid, response).await;
            return Ok(RunOutcome {
                response,
                timed_out: false,
                time_range,
            });
        }

        // Resolved before anything runs so every step buckets identically.
        let granularity = if companion.is_some() {
            time_range.validate()?;
            Some(context.resolved_granularity())
        } else {
            None
        };

        let is_async = delivery.is_streaming();
        let ctx = Arc::new(context);
        let (primary_handle, primary_rx) = self
            .registry
            .start(qid, is_async, Arc::new(primary), ctx.clone(), true)
            .await?;
        let (companion_binding, companion_rx) = match companion {
            Some(spec) => {
                let cqid = self.registry.next_qid();
                match self
                    .registry
                    .start(cqid, is_async, Arc::new(spec), ctx.clone(), true)
                    .await
                {
                    Ok((handle, rx)) => (Some(Binding::new(handle)), Some(rx)),
                    Err(e) => {
                        self.registry.delete(qid).await;
                        return Err(e);
                    }
                }
            }
            None => (None, None),
        };
        let events = StateMultiplexer::new(primary_rx, companion_rx)
            .with_capacity(self.config().event_buffer)
            .spawn();

        let mut lifecycle = Lifecycle {
            coordinator: self,
            delivery,
            primary: Binding::new(primary_handle),
            companion: companion_binding,
            events,
            deferred: VecDeque::new(),
            granularity,
            size_limit,
            timed_out: false,
        };
        let result = lifecycle.run().await;
        lifecycle.deregister_all().await;

        result.map(|response| RunOutcome {
            response,
            timed_out: lifecycle.timed_out,
            time_range,
        })
    }
}

// =============================================================================
// Lifecycle loop
// =============================================================================

/// Current `(id, handle)` of one source plus its final payload once it
/// completed. A restart replaces `handle` wholesale.
struct Binding {
    handle: QueryExecutionHandle,
    result: Option<QueryResponse>,
}

impl Binding {
    fn new(handle: QueryExecutionHandle) -> Self {
        Self {
            handle,
            result: None,
        }
    }

    fn is_pending(&self) -> bool {
        self.result.is_none()
    }
}

enum Flow {
    Continue,
    Done(Option<QueryResponse>),
}

fn other(source: SourceIndex) -> SourceIndex {
    match source {
        SourceIndex::Primary => SourceIndex::Companion,
        SourceIndex::Companion => SourceIndex::Primary,
    }
}

struct Lifecycle<'a, D> {
    coordinator: &'a Coordinator,
    delivery: &'a mut D,
    primary: Binding,
    companion: Option<Binding>,
    events: mpsc::Receiver<StateEvent>,
    /// Events set aside while waiting for a restart confirmation.
    deferred: VecDeque<StateEvent>,
    granularity: Option<Granularity>,
    size_limit: u64,
    timed_out: bool,
}

impl<D: Delivery> Lifecycle<'_, D> {
    async fn run(&mut self) -> Result<Option<QueryResponse>, CoordinatorError> {
        loop {
            let event = match self.deferred.pop_front() {
                Some(ev) => ev,
                None => tokio::select! {
                    ev = self.events.recv() => match ev {
                        Some(ev) => ev,
                        None => {
                            let qid = self.primary.handle.qid;
                            return self.fail(qid, CoordinatorError::EventStreamClosed).await;
                        }
                    },
                    _ = self.delivery.client_cancelled() => {
                        self.cancel_all().await;
                        continue;
                    }
                },
            };
            if let Flow::Done(response) = self.handle(event).await? {
                return Ok(response);
            }
        }
    }

    fn binding(&self, source: SourceIndex) -> Option<&Binding> {
        match source {
            SourceIndex::Primary => Some(&self.primary),
            SourceIndex::Companion => self.companion.as_ref(),
        }
    }

    fn binding_mut(&mut self, source: SourceIndex) -> Option<&mut Binding> {
        match source {
            SourceIndex::Primary => Some(&mut self.primary),
            SourceIndex::Companion => self.companion.as_mut(),
        }
    }

    fn current_qids(&self) -> Vec<QueryId> {
        std::iter::once(&self.primary)
            .chain(self.companion.as_ref())
            .map(|b| b.handle.qid)
            .collect()
    }

    async fn handle(&mut self, event: StateEvent) -> Result<Flow, CoordinatorError> {
        let StateEvent {
            qid,
            source,
            change,
        } = event;
        let Some(binding) = self.binding_mut(source) else {
            tracing::debug!("qid={}, dropping event for absent {} source", qid, source);
            return Ok(Flow::Continue);
        };
        if binding.handle.qid != qid || !binding.is_pending() {
            tracing::debug!(
                "qid={}, discarding stale {} event, {} source is at qid={}",
                qid,
                change.state(),
                source,
                binding.handle.qid
            );
            return Ok(Flow::Continue);
        }
        binding.handle.latest_state = change.state();

        match change {
            StateChange::Waiting => Ok(Flow::Continue),
            StateChange::Ready => {
                self.launch(source);
                Ok(Flow::Continue)
            }
            StateChange::Running => {
                self.delivery.running(qid, source).await;
                Ok(Flow::Continue)
            }
            StateChange::Update(payload) => {
                self.delivery.update(qid, source, payload).await;
                Ok(Flow::Continue)
            }
            StateChange::Complete(response) => self.on_complete(source, *response).await,
            StateChange::Error(err) => {
                let coordinator = self
                    .binding(source)
                    .map_or(false, |b| b.handle.coordinator);
                if coordinator && err.is_rpc_unavailable() {
                    tracing::warn!("qid={}, {} execution lost its worker: {}", qid, source, err);
                    return self.restart_after_loss(source).await;
                }
                self.fail(qid, CoordinatorError::Execution { qid, source: err })
                    .await
                    .map(Flow::Done)
            }
            StateChange::Timeout => self.on_timeout().await,
            StateChange::Cancelled => self.on_cancelled().await,
            StateChange::Restart => match self.restart_source(source).await {
                Ok(()) => Ok(Flow::Continue),
                Err(e) => self.fail(qid, e).await.map(Flow::Done),
            },
        }
    }

    fn launch(&self, source: SourceIndex) {
        let Some(binding) = self.binding(source) else {
            return;
        };
        let handle = &binding.handle;
        let qid = handle.qid;
        let run = ExecutionRun {
            qid,
            is_async: handle.is_async,
            spec: handle.spec.clone(),
            ctx: handle.ctx.clone(),
            size_limit: self.size_limit,
            progress: ProgressSender::new(qid, handle.tx.clone()),
            cancel: handle.cancel.clone(),
        };
        let engine = self.coordinator.engine.clone();
        let tx = handle.tx.clone();
        tracing::debug!("qid={}, launching {} execution", qid, source);

        tokio::spawn(async move {
            let cancel = run.cancel.clone();
            let change = match engine.execute(run).await {
                Ok(response) => StateChange::Complete(Box::new(response)),
                // Whoever cancelled already reported it.
                Err(_) if cancel.is_cancelled() => return,
                Err(e) => StateChange::Error(e),
            };
            let _ = tx.send(StateUpdate::new(qid, change)).await;
        });
    }

    async fn on_complete(
        &mut self,
        source: SourceIndex,
        response: QueryResponse,
    ) -> Result<Flow, CoordinatorError> {
        let coordinator = self.coordinator;
        let registry = &coordinator.registry;
        let Some(binding) = self.binding_mut(source) else {
            return Ok(Flow::Continue);
        };
        registry.delete(binding.handle.qid).await;
        binding.result = Some(response);

        let companion_pending = self.companion.as_ref().map_or(false, Binding::is_pending);
        if self.primary.is_pending() || companion_pending {
            return Ok(Flow::Continue);
        }

        let qid = self.primary.handle.qid;
        let Some(mut response) = self.primary.result.take() else {
            return Ok(Flow::Continue);
        };
        if let Some(histogram) = self.companion.as_mut().and_then(|c| c.result.take()) {
            match self.densify(histogram) {
                Ok(histogram) => response.timechart_complete = Some(Box::new(histogram)),
                Err(e) => return self.fail(qid, e).await.map(Flow::Done),
            }
        }
        self.annotate(&mut response);
        Ok(Flow::Done(self.delivery.complete(qid, response).await))
    }

    fn densify(&self, mut histogram: QueryResponse) -> Result<QueryResponse, CoordinatorError> {
        let ctx = &self.primary.handle.ctx;
        let granularity = self
            .granularity
            .unwrap_or_else(|| ctx.resolved_granularity());
        let dense = reconcile(
            &histogram.measure_results,
            &histogram.measure_functions,
            &ctx.time_range,
            &granularity,
        )?;
        histogram.bucket_count = dense.len();
        histogram.measure_results = dense;
        if let Some(companion) = &self.companion {
            if companion.handle.qtype != QueryType::Unknown {
                histogram.qtype = companion.handle.qtype;
            }
        }
        Ok(histogram)
    }

    fn annotate(&self, response: &mut QueryResponse) {
        if self.primary.handle.qtype != QueryType::Unknown {
            response.qtype = self.primary.handle.qtype;
        }
        response.can_scroll_more =
            self.size_limit > 0 && response.hits.len() as u64 == self.size_limit;
    }

    async fn on_timeout(&mut self) -> Result<Flow, CoordinatorError> {
        self.timed_out = true;
        self.deregister_all().await;
        let timeout_secs = self.coordinator.config().query_timeout_secs;

        for source in [SourceIndex::Primary, SourceIndex::Companion] {
            let Some(binding) = self.binding_mut(source) else {
                continue;
            };
            let qid = binding.handle.qid;
            let Some(mut response) = binding.result.take() else {
                self.delivery.timed_out(qid, timeout_secs).await?;
                continue;
            };
            match source {
                SourceIndex::Primary => self.annotate(&mut response),
                SourceIndex::Companion => match self.densify(response) {
                    Ok(dense) => response = dense,
                    Err(e) => {
                        // Never deliver the sparse series.
                        self.delivery.failed(qid, e).await?;
                        continue;
                    }
                },
            }
            self.delivery.complete(qid, response).await;
        }
        Ok(Flow::Done(None))
    }

    async fn on_cancelled(&mut self) -> Result<Flow, CoordinatorError> {
        self.deregister_all().await;
        for qid in self.current_qids() {
            self.delivery.cancelled(qid).await;
        }
        Ok(Flow::Done(None))
    }

    async fn cancel_all(&mut self) {
        let coordinator = self.coordinator;
        let registry = &coordinator.registry;
        tracing::info!("qid={}, client requested cancel", self.primary.handle.qid);
        for binding in std::iter::once(&self.primary).chain(self.companion.as_ref()) {
            if binding.is_pending() {
                registry.cancel(binding.handle.qid).await;
            }
        }
    }

    async fn fail(
        &mut self,
        qid: QueryId,
        err: CoordinatorError,
    ) -> Result<Option<QueryResponse>, CoordinatorError> {
        self.deregister_all().await;
        self.delivery.failed(qid, err).await?;
        Ok(None)
    }

    async fn deregister_all(&self) {
        for qid in self.current_qids() {
            self.coordinator.registry.delete(qid).await;
        }
    }

    // =========================================================================
    // Restart
    // =========================================================================

    /// Swap `source` onto a fresh id on the same state stream.
    async fn restart_source(&mut self, source: SourceIndex) -> Result<(), CoordinatorError> {
        let coordinator = self.coordinator;
        let registry = &coordinator.registry;
        let Some(binding) = self.binding_mut(source) else {
            return Ok(());
        };
        let next = binding.handle.restart(registry).await?;
        binding.handle = next;
        Ok(())
    }

    /// `trigger` lost its worker. Restart it now; if the other source is
    /// still running, wait for it to report the same loss before
    /// restarting it too. If it finishes or fails instead, it is left to the
    /// normal path. A half-restarted query is torn down entirely.
    async fn restart_after_loss(&mut self, trigger: SourceIndex) -> Result<Flow, CoordinatorError> {
        let trigger_qid = self
            .binding(trigger)
            .map(|b| b.handle.qid)
            .unwrap_or(self.primary.handle.qid);
        if let Err(e) = self.restart_source(trigger).await {
            return self.fail(trigger_qid, e).await.map(Flow::Done);
        }

        let peer = other(trigger);
        let Some(peer_qid) = self
            .binding(peer)
            .filter(|b| b.is_pending())
            .map(|b| b.handle.qid)
        else {
            return Ok(Flow::Continue);
        };

        let trigger_qid = self
            .binding(trigger)
            .map(|b| b.handle.qid)
            .unwrap_or(trigger_qid);
        let restarted = match self
            .await_restart_confirmation(peer, peer_qid, trigger, trigger_qid)
            .await
        {
            Confirmation::Restart => {
                if let Some(binding) = self.binding_mut(peer) {
                    binding.handle.latest_state = QueryState::QueryRestart;
                }
                self.restart_source(peer).await
            }
            // The settling event is queued for the normal path.
            Confirmation::Settled => Ok(()),
            Confirmation::Lapsed => Err(CoordinatorError::RestartTimeout {
                qid: peer_qid,
                waited_ms: self.coordinator.config().restart_wait_ms,
            }),
        };

        match restarted {
            Ok(()) => Ok(Flow::Continue),
            // Deregisters the trigger's new id along with the peer.
            Err(e) => self.fail(peer_qid, e).await.map(Flow::Done),
        }
    }

    /// Wait up to `restart_wait` for `QUERY_RESTART` (or the same
    /// worker-loss error) on `peer`'s current id. A terminal event on either
    /// source ends the wait early. Everything seen meanwhile is deferred in
    /// order, the settling event included.
    async fn await_restart_confirmation(
        &mut self,
        peer: SourceIndex,
        peer_qid: QueryId,
        trigger: SourceIndex,
        trigger_qid: QueryId,
    ) -> Confirmation {
        if let Some(pos) = self.deferred.iter().position(|ev| confirms(ev, peer, peer_qid)) {
            self.deferred.remove(pos);
            return Confirmation::Restart;
        }
        let settled = |ev: &StateEvent| {
            settles(ev, peer, peer_qid) || ends_trigger(ev, trigger, trigger_qid)
        };
        if self.deferred.iter().any(settled) {
            return Confirmation::Settled;
        }

        let wait = self.coordinator.config().restart_wait();
        let events = &mut self.events;
        let deferred = &mut self.deferred;
        let outcome = tokio::time::timeout(wait, async {
            while let Some(ev) = events.recv().await {
                if confirms(&ev, peer, peer_qid) {
                    return Confirmation::Restart;
                }
                let done = settled(&ev);
                deferred.push_back(ev);
                if done {
                    return Confirmation::Settled;
                }
            }
            Confirmation::Lapsed
        })
        .await;

        match outcome {
            Ok(Confirmation::Settled) => {
                tracing::info!(
                    "qid={}, {} source settled while awaiting restart, not restarting it",
                    peer_qid,
                    peer
                );
                Confirmation::Settled
            }
            Ok(confirmation) => confirmation,
            Err(_) => {
                tracing::warn!(
                    "qid={}, {} source did not confirm restart within {}ms",
                    peer_qid,
                    peer,
                    wait.as_millis()
                );
                Confirmation::Lapsed
            }
        }
    }
}

enum Confirmation {
    Restart,
    Settled,
    Lapsed,
}

fn confirms(ev: &StateEvent, source: SourceIndex, qid: QueryId) -> bool {
    ev.source == source
        && ev.qid == qid
        && match &ev.change {
            StateChange::Restart => true,
            StateChange::Error(e) => e.is_rpc_unavailable(),
            _ => false,
        }
}

/// A terminal outcome for `source` that makes restarting it moot.
fn settles(ev: &StateEvent, source: SourceIndex, qid: QueryId) -> bool {
    ev.source == source
        && ev.qid == qid
        && matches!(
            ev.change,
            StateChange::Complete(_)
                | StateChange::Error(_)
                | StateChange::Timeout
                | StateChange::Cancelled
        )
}

fn ends_trigger(ev: &StateEvent, source: SourceIndex, qid: QueryId) -> bool {
    ev.source == source
        && ev.qid == qid
        && matches!(ev.change, StateChange::Timeout | StateChange::Cancelled)
}
