//! Node-wide directory of running flows and rendezvous point for their
//! inbound streams.
//!
//! A producer can open a stream before the consuming flow is registered.
//! [`FlowRegistry::connect_inbound_stream`] then answers with a "consumer not
//! scheduled" handshake and waits for [`FlowRegistry::register_flow`], bounded
//! by a timeout. A registered flow arms one timer covering all of its inbound
//! streams; streams still unconnected when it fires are canceled and their
//! consumers receive a retryable "no inbound stream connection" error.
//!
//! Handshakes: a stream receives one handshake right away if its flow is not
//! registered yet, and one more (consumer scheduled) when it connects. Never
//! zero, never more than two.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rowflow_common::{global_metrics, FlowId, NodeId, Result, RowflowError, StreamId, WaitGroup};
use rowflow_execution::FlowCtx;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::inbound::InboundStreamHandler;
use crate::stream::{ConsumerSignal, ServerStreamRef};

/// A stream a flow expects to be connected from another node.
#[derive(Clone)]
pub struct InboundStreamInfo {
    handler: Arc<dyn InboundStreamHandler>,
    wait_group: WaitGroup,
}

impl InboundStreamInfo {
    /// `wait_group` is decremented once the stream finishes, times out or is
    /// canceled. The caller must have counted the stream in it beforehand.
    pub fn new(handler: Arc<dyn InboundStreamHandler>, wait_group: WaitGroup) -> Self {
        Self {
            handler,
            wait_group,
        }
    }
}

impl fmt::Debug for InboundStreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStreamInfo")
            .field("wait_group", &self.wait_group.count())
            .finish_non_exhaustive()
    }
}

/// Connection state of one inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InboundStreamStatus {
    pub connected: bool,
    pub canceled: bool,
    pub finished: bool,
}

struct InboundStreamState {
    info: InboundStreamInfo,
    status: InboundStreamStatus,
}

struct FlowEntry {
    flow: Option<FlowCtx>,
    inbound_streams: HashMap<StreamId, InboundStreamState>,
    /// Connections currently waiting for this flow to register.
    waiters: usize,
    registered: Arc<Notify>,
    stream_timer: Option<JoinHandle<()>>,
}

impl FlowEntry {
    fn new() -> Self {
        Self {
            flow: None,
            inbound_streams: HashMap::new(),
            waiters: 0,
            registered: Arc::new(Notify::new()),
            stream_timer: None,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    flows: HashMap<FlowId, FlowEntry>,
    draining: bool,
}

type DrainHook = Arc<dyn Fn() + Send + Sync>;

/// Hooks for tests.
#[derive(Clone, Default)]
pub struct RegistryTestingKnobs {
    /// Runs right before every sleep performed by [`FlowRegistry::drain`].
    pub run_before_drain_sleep: Option<DrainHook>,
}

struct RegistryInner {
    node_id: NodeId,
    state: Mutex<RegistryState>,
    registered_flows: watch::Sender<usize>,
    knobs: Mutex<RegistryTestingKnobs>,
}

/// Successful result of [`FlowRegistry::connect_inbound_stream`].
pub struct ConnectedStream {
    pub flow_ctx: FlowCtx,
    pub handler: Arc<dyn InboundStreamHandler>,
    pub cleanup: StreamCleanup,
}

impl fmt::Debug for ConnectedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedStream")
            .field("flow_id", &self.flow_ctx.flow_id)
            .field("stream_id", &self.cleanup.stream_id)
            .finish_non_exhaustive()
    }
}

/// Marks a connected stream finished. Must be called once the handler is done
/// with the stream.
#[must_use]
pub struct StreamCleanup {
    registry: FlowRegistry,
    flow_id: FlowId,
    stream_id: StreamId,
    wait_group: WaitGroup,
}

impl StreamCleanup {
    pub fn finish(self) {
        let mut state = self.registry.inner.state.lock();
        let stream = state
            .flows
            .get_mut(&self.flow_id)
            .and_then(|e| e.inbound_streams.get_mut(&self.stream_id));
        match stream {
            Some(s) => finish_inbound_stream(self.flow_id, self.stream_id, s),
            // The flow was unregistered while the stream ran.
            None => self.wait_group.done(),
        }
    }
}

fn finish_inbound_stream(flow_id: FlowId, stream_id: StreamId, s: &mut InboundStreamState) {
    if s.status.finished {
        warn!(%flow_id, %stream_id, "inbound stream finished twice");
        return;
    }
    debug_assert!(s.status.connected || s.status.canceled);
    s.status.finished = true;
    s.info.wait_group.done();
}

/// Process-wide flow directory, owned by the node server and shared by
/// cloning.
#[derive(Clone)]
pub struct FlowRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("node_id", &self.inner.node_id)
            .field("registered_flows", &*self.inner.registered_flows.borrow())
            .finish()
    }
}

impl FlowRegistry {
    pub fn new(node_id: NodeId) -> Self {
        let (registered_flows, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                node_id,
                state: Mutex::new(RegistryState::default()),
                registered_flows,
                knobs: Mutex::new(RegistryTestingKnobs::default()),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn set_testing_knobs(&self, knobs: RegistryTestingKnobs) {
        *self.inner.knobs.lock() = knobs;
    }

    /// Number of currently registered flows.
    pub fn num_registered_flows(&self) -> usize {
        *self.inner.registered_flows.borrow()
    }

    /// Whether a completed drain is rejecting new flows.
    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    /// Publish `flow_ctx` and its expected inbound streams.
    ///
    /// Connections already waiting for this flow are woken. Streams still
    /// unconnected after `timeout` are canceled. Must be called within a tokio
    /// runtime when `inbound_streams` is non-empty.
    pub fn register_flow(
        &self,
        flow_ctx: FlowCtx,
        inbound_streams: HashMap<StreamId, InboundStreamInfo>,
        timeout: Duration,
    ) -> Result<()> {
        let flow_id = flow_ctx.flow_id;
        let mut state = self.inner.state.lock();
        if state.draining {
            return Err(RowflowError::Connection(format!(
                "could not register flow {flow_id} because the registry is draining"
            )));
        }
        let entry = state.flows.entry(flow_id).or_insert_with(FlowEntry::new);
        if entry.flow.is_some() {
            return Err(RowflowError::Internal(format!(
                "flow already registered: {flow_id}"
            )));
        }
        let num_streams = inbound_streams.len();
        entry.flow = Some(flow_ctx);
        entry.inbound_streams = inbound_streams
            .into_iter()
            .map(|(id, info)| {
                (
                    id,
                    InboundStreamState {
                        info,
                        status: InboundStreamStatus::default(),
                    },
                )
            })
            .collect();
        entry.registered.notify_waiters();
        if num_streams > 0 {
            let registry = Arc::downgrade(&self.inner);
            entry.stream_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = Weak::upgrade(&registry) {
                    FlowRegistry { inner }.time_out_pending_streams(flow_id);
                }
            }));
        }
        drop(state);

        self.inner.registered_flows.send_modify(|n| *n += 1);
        global_metrics().flow_registered(self.inner.node_id);
        info!(%flow_id, inbound_streams = num_streams, "registered flow");
        Ok(())
    }

    /// Remove the flow. Does not wait for its streams.
    pub fn unregister_flow(&self, flow_id: FlowId) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.flows.get_mut(&flow_id) else {
            return;
        };
        if entry.flow.take().is_none() {
            return;
        }
        entry.inbound_streams.clear();
        if let Some(timer) = entry.stream_timer.take() {
            timer.abort();
        }
        if entry.waiters == 0 {
            state.flows.remove(&flow_id);
        }
        drop(state);

        self.inner.registered_flows.send_modify(|n| *n = n.saturating_sub(1));
        global_metrics().flow_unregistered(self.inner.node_id);
        debug!(%flow_id, "unregistered flow");
    }

    /// The registered flow, waiting up to `timeout` for it to register.
    pub async fn lookup_flow(&self, flow_id: FlowId, timeout: Duration) -> Option<FlowCtx> {
        if let Some(flow) = self.registered_flow(flow_id) {
            return Some(flow);
        }
        if timeout.is_zero() {
            return None;
        }
        self.wait_for_flow(flow_id, timeout).await
    }

    /// Status of one inbound stream of a registered flow.
    pub fn inbound_stream_status(
        &self,
        flow_id: FlowId,
        stream_id: StreamId,
    ) -> Result<InboundStreamStatus> {
        let state = self.inner.state.lock();
        let entry = state
            .flows
            .get(&flow_id)
            .filter(|e| e.flow.is_some())
            .ok_or_else(|| RowflowError::Connection(format!("missing flow entry: {flow_id}")))?;
        entry
            .inbound_streams
            .get(&stream_id)
            .map(|s| s.status)
            .ok_or_else(|| RowflowError::Connection(format!("missing stream entry: {stream_id}")))
    }

    /// Connect an arriving stream to its consumer.
    ///
    /// Waits up to `timeout` for the flow to register. Fails with "not found"
    /// when it never does, and with "came too late" when the flow already
    /// gave up on this stream.
    pub async fn connect_inbound_stream(
        &self,
        flow_id: FlowId,
        stream_id: StreamId,
        stream: &ServerStreamRef,
        timeout: Duration,
    ) -> Result<ConnectedStream> {
        if self.registered_flow(flow_id).is_none() {
            stream.send(ConsumerSignal::handshake(false)).await?;
            if self.wait_for_flow(flow_id, timeout).await.is_none() {
                return Err(RowflowError::Connection(format!("flow {flow_id} not found")));
            }
        }

        let (flow_ctx, handler, wait_group) = {
            let mut state = self.inner.state.lock();
            let entry = state
                .flows
                .get_mut(&flow_id)
                .filter(|e| e.flow.is_some())
                .ok_or_else(|| RowflowError::Connection(format!("flow {flow_id} not found")))?;
            let flow_ctx = entry.flow.clone().ok_or_else(|| {
                RowflowError::Internal(format!("flow {flow_id} vanished while connecting"))
            })?;
            let s = entry.inbound_streams.get_mut(&stream_id).ok_or_else(|| {
                RowflowError::Connection(format!("flow {flow_id}: no inbound stream {stream_id}"))
            })?;
            if s.status.connected {
                return Err(RowflowError::Connection(format!(
                    "flow {flow_id}: inbound stream {stream_id} already connected"
                )));
            }
            if s.status.canceled {
                return Err(RowflowError::Connection(format!(
                    "flow {flow_id}: inbound stream {stream_id} came too late"
                )));
            }
            s.status.connected = true;
            (flow_ctx, Arc::clone(&s.info.handler), s.info.wait_group.clone())
        };

        if let Err(err) = stream.send(ConsumerSignal::handshake(true)).await {
            // Leave the stream to the flow's timer.
            let mut state = self.inner.state.lock();
            if let Some(s) = state
                .flows
                .get_mut(&flow_id)
                .and_then(|e| e.inbound_streams.get_mut(&stream_id))
            {
                s.status.connected = false;
            }
            return Err(err);
        }
        debug!(%flow_id, %stream_id, "connected inbound stream");
        Ok(ConnectedStream {
            flow_ctx,
            handler,
            cleanup: StreamCleanup {
                registry: self.clone(),
                flow_id,
                stream_id,
                wait_group,
            },
        })
    }

    /// Cancel every inbound stream of `flow_id` that has not connected yet,
    /// delivering `err` to its consumer without blocking the caller.
    pub fn cancel_pending_streams(&self, flow_id: FlowId, err: RowflowError) -> usize {
        let handlers = self.take_pending_streams(flow_id);
        let n = handlers.len();
        deliver_to_pending(handlers, err);
        n
    }

    /// Stop accepting new flows once running ones finish.
    ///
    /// Waits for registered flows for at most `flow_drain_wait`, and at least
    /// `min_flow_drain_wait` overall so that flows racing into registration
    /// are waited for too. New flows are rejected after this returns.
    pub async fn drain(&self, flow_drain_wait: Duration, min_flow_drain_wait: Duration) {
        let start = Instant::now();
        info!(node_id = %self.inner.node_id, "draining flow registry");
        if self.num_registered_flows() == 0 {
            self.sleep_before_drain(min_flow_drain_wait).await;
            if self.num_registered_flows() == 0 {
                self.finish_drain(start);
                return;
            }
        }
        let deadline = Instant::now().checked_add(flow_drain_wait);
        self.wait_for_no_flows(deadline).await;

        let waited = start.elapsed();
        if waited < min_flow_drain_wait {
            self.sleep_before_drain(min_flow_drain_wait - waited).await;
            self.wait_for_no_flows(deadline).await;
        }
        self.finish_drain(start);
    }

    /// Accept new flows again after a drain.
    pub fn undrain(&self) {
        self.inner.state.lock().draining = false;
    }

    fn registered_flow(&self, flow_id: FlowId) -> Option<FlowCtx> {
        self.inner
            .state
            .lock()
            .flows
            .get(&flow_id)
            .and_then(|e| e.flow.clone())
    }

    async fn wait_for_flow(&self, flow_id: FlowId, timeout: Duration) -> Option<FlowCtx> {
        let notify = {
            let mut state = self.inner.state.lock();
            let entry = state.flows.entry(flow_id).or_insert_with(FlowEntry::new);
            if let Some(flow) = &entry.flow {
                return Some(flow.clone());
            }
            entry.waiters += 1;
            Arc::clone(&entry.registered)
        };
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.registered_flow(flow_id).is_none() {
            let _ = tokio::time::timeout(timeout, notified).await;
        }

        let mut state = self.inner.state.lock();
        let entry = state.flows.get_mut(&flow_id)?;
        entry.waiters = entry.waiters.saturating_sub(1);
        let flow = entry.flow.clone();
        if flow.is_none() && entry.waiters == 0 {
            state.flows.remove(&flow_id);
        }
        flow
    }

    fn take_pending_streams(&self, flow_id: FlowId) -> Vec<Arc<dyn InboundStreamHandler>> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.flows.get_mut(&flow_id).filter(|e| e.flow.is_some()) else {
            return Vec::new();
        };
        let mut handlers = Vec::new();
        for (stream_id, s) in entry.inbound_streams.iter_mut() {
            if !s.status.connected && !s.status.finished && !s.status.canceled {
                s.status.canceled = true;
                handlers.push(Arc::clone(&s.info.handler));
                finish_inbound_stream(flow_id, *stream_id, s);
            }
        }
        handlers
    }

    fn time_out_pending_streams(&self, flow_id: FlowId) {
        let handlers = self.take_pending_streams(flow_id);
        if handlers.is_empty() {
            return;
        }
        error!(
            %flow_id,
            streams = handlers.len(),
            "inbound streams did not connect in time"
        );
        global_metrics().inbound_streams_timed_out(self.inner.node_id, handlers.len() as u64);
        deliver_to_pending(
            handlers,
            RowflowError::Connection("no inbound stream connection".to_string()),
        );
    }

    async fn sleep_before_drain(&self, d: Duration) {
        let hook = self.inner.knobs.lock().run_before_drain_sleep.clone();
        if let Some(hook) = hook {
            hook();
        }
        tokio::time::sleep(d).await;
    }

    async fn wait_for_no_flows(&self, deadline: Option<Instant>) {
        let mut rx = self.inner.registered_flows.subscribe();
        let all_done = rx.wait_for(|n| *n == 0);
        match deadline {
            Some(deadline) => {
                let _ = tokio::time::timeout_at(deadline, all_done).await;
            }
            None => {
                let _ = all_done.await;
            }
        }
    }

    fn finish_drain(&self, start: Instant) {
        let mut state = self.inner.state.lock();
        state.draining = true;
        let remaining = state.flows.values().filter(|e| e.flow.is_some()).count();
        drop(state);
        if remaining > 0 {
            warn!(remaining, "flow registry drained with flows still running");
        }
        global_metrics().observe_drain(self.inner.node_id, start.elapsed().as_secs_f64());
        info!(node_id = %self.inner.node_id, "flow registry drained");
    }
}

/// Push `err` into each handler on a blocking thread; pushes may block on a
/// full receiver.
fn deliver_to_pending(handlers: Vec<Arc<dyn InboundStreamHandler>>, err: RowflowError) {
    for handler in handlers {
        let err = err.clone();
        tokio::task::spawn_blocking(move || handler.timeout(err));
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
