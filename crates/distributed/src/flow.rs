//! Node-local fragment of a distributed query and its lifecycle.
//!
//! A [`Flow`] owns the processors of one [`FlowSpec`] plus the plumbing
//! between them:
//! - local edges are [`RowChannel`]s;
//! - inbound remote streams are registered with the [`FlowRegistry`] and
//!   pushed into the consuming processor's channel;
//! - remote outputs go through a columnarizer into an [`Outbox`].
//!
//! Lifecycle: `start` registers the flow (unless it is purely local) and runs
//! every processor on its own blocking task; `wait` joins them; `cleanup`
//! unregisters. `cancel` may be called at any point.

use std::collections::HashMap;
use std::sync::Arc;

use rowflow_common::{
    global_metrics, FlowId, NodeId, ProcessorId, Result, RowflowError, StreamId, WaitGroup,
};
use rowflow_execution::vectorized::Columnarizer;
use rowflow_execution::{
    new_processor, run_processor, ColumnType, FlowCtx, PostProcessSpec, ProcessorCoreUnion,
    RowChannel, RowReceiver, RowSource, SourceItem,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::inbound::{CancelSignal, RowInboundStreamHandler};
use crate::outbox::{CancelFn, Outbox};
use crate::registry::{FlowRegistry, InboundStreamInfo};
use crate::server::NodeDialer;

/// Plan of the part of a query running on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub flow_id: FlowId,
    pub processors: Vec<ProcessorSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub processor_id: ProcessorId,
    pub core: ProcessorCoreUnion,
    #[serde(default)]
    pub post: PostProcessSpec,
    #[serde(default)]
    pub inputs: Vec<InputSyncSpec>,
    pub output: StreamEndpointSpec,
}

/// One processor input. Rows of all `streams` are merged in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSyncSpec {
    pub types: Vec<ColumnType>,
    pub streams: Vec<StreamEndpointSpec>,
}

/// One end of a stream.
///
/// As an input, `Remote` names a stream arriving from another node; as an
/// output, it names the node to send to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEndpointSpec {
    Local { stream_id: StreamId },
    Remote { stream_id: StreamId, target_node: NodeId },
    SyncResponse,
}

struct PendingProcessor {
    source: Box<dyn RowSource>,
    output: Arc<dyn RowReceiver>,
}

struct PendingOutbox {
    outbox: Outbox,
    target: NodeId,
    stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowStatus {
    Setup,
    Started,
    CleanedUp,
}

pub struct Flow {
    flow_ctx: FlowCtx,
    registry: FlowRegistry,
    dialer: Arc<dyn NodeDialer>,
    processors: Vec<PendingProcessor>,
    outboxes: Vec<PendingOutbox>,
    inbound_streams: HashMap<StreamId, InboundStreamInfo>,
    sync_output: Option<Arc<dyn RowReceiver>>,
    wait_group: WaitGroup,
    cancel_signal: CancelSignal,
    tasks: Vec<JoinHandle<()>>,
    registered: bool,
    status: FlowStatus,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("flow_id", &self.flow_ctx.flow_id)
            .field("processors", &self.processors.len())
            .field("outboxes", &self.outboxes.len())
            .field("inbound_streams", &self.inbound_streams.len())
            .field("status", &self.status)
            .finish()
    }
}

impl Flow {
    /// Build every processor and stream of `spec`.
    ///
    /// `sync_output` receives the output of the processor whose output is
    /// [`StreamEndpointSpec::SyncResponse`]; at most one processor may have
    /// such an output, and only when a receiver is given.
    pub fn setup(
        flow_ctx: FlowCtx,
        spec: &FlowSpec,
        registry: FlowRegistry,
        dialer: Arc<dyn NodeDialer>,
        sync_output: Option<Arc<dyn RowReceiver>>,
    ) -> Result<Self> {
        let cfg = Arc::clone(&flow_ctx.config);
        let cancel_signal = CancelSignal::new();
        let wait_group = WaitGroup::new();
        let mut inbound_streams = HashMap::new();
        // Local stream id -> channel of the consuming input.
        let mut local_inputs: HashMap<StreamId, RowChannel> = HashMap::new();
        let mut processor_inputs = Vec::with_capacity(spec.processors.len());

        for p in &spec.processors {
            let mut inputs: Vec<Box<dyn RowSource>> = Vec::with_capacity(p.inputs.len());
            for input in &p.inputs {
                if input.streams.is_empty() {
                    return Err(RowflowError::Planning(format!(
                        "processor {}: input without streams",
                        p.processor_id
                    )));
                }
                let channel = RowChannel::new(
                    input.types.clone(),
                    cfg.row_channel_buffer_size,
                    input.streams.len(),
                );
                for stream in &input.streams {
                    match *stream {
                        StreamEndpointSpec::Local { stream_id } => {
                            if local_inputs.insert(stream_id, channel.clone()).is_some() {
                                return Err(RowflowError::Planning(format!(
                                    "local stream {stream_id} consumed twice"
                                )));
                            }
                        }
                        StreamEndpointSpec::Remote { stream_id, .. } => {
                            let handler = RowInboundStreamHandler::new(
                                Arc::new(channel.clone()),
                                cancel_signal.clone(),
                            );
                            let info =
                                InboundStreamInfo::new(Arc::new(handler), wait_group.clone());
                            if inbound_streams.insert(stream_id, info).is_some() {
                                return Err(RowflowError::Planning(format!(
                                    "inbound stream {stream_id} consumed twice"
                                )));
                            }
                        }
                        StreamEndpointSpec::SyncResponse => {
                            return Err(RowflowError::Planning(format!(
                                "processor {}: sync response used as an input",
                                p.processor_id
                            )));
                        }
                    }
                }
                inputs.push(Box::new(channel));
            }
            processor_inputs.push(inputs);
        }

        let mut processors = Vec::with_capacity(spec.processors.len());
        let mut outboxes = Vec::new();
        let mut sync_used = false;
        for (p, inputs) in spec.processors.iter().zip(processor_inputs) {
            let source = new_processor(&flow_ctx, p.processor_id, &p.core, &p.post, inputs)?;
            let output: Arc<dyn RowReceiver> = match p.output {
                StreamEndpointSpec::Local { stream_id } => {
                    let channel = local_inputs.remove(&stream_id).ok_or_else(|| {
                        RowflowError::Planning(format!("local stream {stream_id} has no consumer"))
                    })?;
                    Arc::new(channel)
                }
                StreamEndpointSpec::Remote {
                    stream_id,
                    target_node,
                } => {
                    let channel = RowChannel::new(
                        source.output_types().to_vec(),
                        cfg.row_channel_buffer_size,
                        1,
                    );
                    let columnarizer = Columnarizer::new(&flow_ctx, Box::new(channel.clone()));
                    let meta = columnarizer.metadata_source();
                    let outbox = Outbox::new(&flow_ctx, Box::new(columnarizer), vec![meta])
                        .with_cancel_signal(cancel_signal.clone());
                    outboxes.push(PendingOutbox {
                        outbox,
                        target: target_node,
                        stream_id,
                    });
                    Arc::new(channel)
                }
                StreamEndpointSpec::SyncResponse => {
                    let receiver = sync_output.as_ref().filter(|_| !sync_used).ok_or_else(|| {
                        RowflowError::Planning(format!(
                            "processor {}: unexpected sync response output",
                            p.processor_id
                        ))
                    })?;
                    sync_used = true;
                    Arc::clone(receiver)
                }
            };
            processors.push(PendingProcessor { source, output });
        }
        if let Some(stream_id) = local_inputs.keys().next() {
            return Err(RowflowError::Planning(format!(
                "local stream {stream_id} has no producer"
            )));
        }

        debug!(
            flow_id = %flow_ctx.flow_id,
            processors = processors.len(),
            outboxes = outboxes.len(),
            inbound_streams = inbound_streams.len(),
            "flow set up"
        );
        Ok(Self {
            flow_ctx,
            registry,
            dialer,
            processors,
            outboxes,
            inbound_streams,
            sync_output,
            wait_group,
            cancel_signal,
            tasks: Vec::new(),
            registered: false,
            status: FlowStatus::Setup,
        })
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_ctx.flow_id
    }

    pub fn flow_ctx(&self) -> &FlowCtx {
        &self.flow_ctx
    }

    /// A flow with neither inbound streams nor outboxes needs no registration.
    pub fn is_local(&self) -> bool {
        self.inbound_streams.is_empty() && self.outboxes.is_empty()
    }

    /// Register the flow and start its processors and outboxes.
    ///
    /// Must be called within a tokio runtime. When registration fails and the
    /// flow has a sync output, the error is delivered there and `start`
    /// succeeds without running anything.
    pub fn start(&mut self) -> Result<()> {
        if self.status != FlowStatus::Setup {
            return Err(RowflowError::Internal(format!(
                "flow {} started twice",
                self.flow_ctx.flow_id
            )));
        }
        self.status = FlowStatus::Started;
        let flow_id = self.flow_ctx.flow_id;

        if !self.is_local() {
            let inbound = std::mem::take(&mut self.inbound_streams);
            let num_inbound = inbound.len();
            self.wait_group.add(num_inbound);
            let timeout = self.flow_ctx.config.flow_stream_timeout;
            if let Err(err) = self.registry.register_flow(self.flow_ctx.clone(), inbound, timeout) {
                for _ in 0..num_inbound {
                    self.wait_group.done();
                }
                self.processors.clear();
                self.outboxes.clear();
                return match &self.sync_output {
                    Some(out) => {
                        warn!(%flow_id, error = %err, "flow registration failed");
                        out.push(SourceItem::Meta(err.into()));
                        out.producer_done();
                        Ok(())
                    }
                    None => Err(err),
                };
            }
            self.registered = true;
        }

        let cancel_fn = self.cancel_fn();
        for PendingOutbox {
            outbox,
            target,
            stream_id,
        } in self.outboxes.drain(..)
        {
            let dialer = Arc::clone(&self.dialer);
            let cancel = Some(Arc::clone(&cancel_fn));
            self.tasks.push(tokio::spawn(async move {
                outbox.run(dialer, target, flow_id, stream_id, cancel).await;
            }));
        }

        for PendingProcessor { mut source, output } in self.processors.drain(..) {
            let ctx = self.flow_ctx.clone();
            self.tasks.push(tokio::task::spawn_blocking(move || {
                run_processor(&ctx, source.as_mut(), output.as_ref());
            }));
        }
        info!(%flow_id, tasks = self.tasks.len(), "flow started");
        Ok(())
    }

    /// Wait for every processor and outbox, then for the inbound streams.
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(flow_id = %self.flow_ctx.flow_id, error = %e, "flow task failed");
            }
        }
        self.wait_group.wait().await;
    }

    /// Cancel the flow.
    ///
    /// Unconnected inbound streams get a `QueryCanceled` error pushed into
    /// their receivers off the calling thread; connected ones stop reading.
    /// Outboxes stop sending and drain their inputs, which releases the
    /// processors feeding them.
    pub fn cancel(&self) {
        let flow_id = self.flow_ctx.flow_id;
        info!(%flow_id, "canceling flow");
        self.flow_ctx.cancel();
        self.cancel_signal.cancel();
        if self.registered {
            let n = self
                .registry
                .cancel_pending_streams(flow_id, RowflowError::QueryCanceled);
            debug!(%flow_id, streams = n, "canceled pending inbound streams");
        }
        global_metrics().flow_canceled(self.flow_ctx.node_id);
    }

    /// Unregister the flow. Idempotent.
    pub fn cleanup(&mut self) {
        if self.status == FlowStatus::CleanedUp {
            return;
        }
        self.status = FlowStatus::CleanedUp;
        if self.registered {
            self.registry.unregister_flow(self.flow_ctx.flow_id);
        }
    }

    /// Start, wait and clean up.
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait().await;
        self.cleanup();
        Ok(())
    }

    fn cancel_fn(&self) -> CancelFn {
        let ctx = self.flow_ctx.clone();
        let signal = self.cancel_signal.clone();
        Arc::new(move || {
            ctx.cancel();
            signal.cancel();
        })
    }
}

#[cfg(test)]
mod tests {
    use rowflow_common::FlowConfig;
    use rowflow_execution::spec::ValuesSpec;
    use rowflow_execution::{Datum, RowBuffer};

    use super::*;
    use crate::server::LocalDialer;

    fn values(id: u32, rows: Vec<Vec<Datum>>, output: StreamEndpointSpec) -> ProcessorSpec {
        ProcessorSpec {
            processor_id: ProcessorId(id),
            core: ProcessorCoreUnion::Values(ValuesSpec {
                types: vec![ColumnType::Int],
                rows,
            }),
            post: PostProcessSpec::default(),
            inputs: Vec::new(),
            output,
        }
    }

    fn noop(id: u32, input: StreamEndpointSpec, output: StreamEndpointSpec) -> ProcessorSpec {
        ProcessorSpec {
            processor_id: ProcessorId(id),
            core: ProcessorCoreUnion::Noop,
            post: PostProcessSpec::default(),
            inputs: vec![InputSyncSpec {
                types: vec![ColumnType::Int],
                streams: vec![input],
            }],
            output,
        }
    }

    fn flow_ctx(flow_id: FlowId) -> FlowCtx {
        FlowCtx::new(flow_id, Arc::new(FlowConfig::default()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_flow_runs_without_registration() {
        let flow_id = FlowId::new_v4();
        let spec = FlowSpec {
            flow_id,
            processors: vec![
                values(
                    1,
                    vec![vec![Datum::Int(1)], vec![Datum::Int(2)]],
                    StreamEndpointSpec::Local { stream_id: StreamId(1) },
                ),
                noop(
                    2,
                    StreamEndpointSpec::Local { stream_id: StreamId(1) },
                    StreamEndpointSpec::SyncResponse,
                ),
            ],
        };
        let registry = FlowRegistry::new(NodeId(0));
        let out = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
        let mut flow = Flow::setup(
            flow_ctx(flow_id),
            &spec,
            registry.clone(),
            Arc::new(LocalDialer::new()),
            Some(out.clone()),
        )
        .expect("setup");
        assert!(flow.is_local());
        flow.run().await.expect("run");
        assert_eq!(registry.num_registered_flows(), 0);
        assert_eq!(out.rows(), vec![vec![Datum::Int(1)], vec![Datum::Int(2)]]);
        assert!(out.producer_done_called());
    }

    #[tokio::test]
    async fn setup_rejects_dangling_local_streams() {
        let flow_id = FlowId::new_v4();
        let spec = FlowSpec {
            flow_id,
            processors: vec![values(
                1,
                Vec::new(),
                StreamEndpointSpec::Local { stream_id: StreamId(9) },
            )],
        };
        let err = Flow::setup(
            flow_ctx(flow_id),
            &spec,
            FlowRegistry::new(NodeId(0)),
            Arc::new(LocalDialer::new()),
            None,
        )
        .expect_err("no consumer");
        assert!(err.to_string().contains("has no consumer"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registration_failure_goes_to_the_sync_output() {
        let flow_id = FlowId::new_v4();
        let spec = FlowSpec {
            flow_id,
            processors: vec![noop(
                1,
                StreamEndpointSpec::Remote {
                    stream_id: StreamId(1),
                    target_node: NodeId(0),
                },
                StreamEndpointSpec::SyncResponse,
            )],
        };
        let registry = FlowRegistry::new(NodeId(0));
        registry.drain(std::time::Duration::ZERO, std::time::Duration::ZERO).await;

        let out = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
        let mut flow = Flow::setup(
            flow_ctx(flow_id),
            &spec,
            registry,
            Arc::new(LocalDialer::new()),
            Some(out.clone()),
        )
        .expect("setup");
        flow.run().await.expect("run");
        let meta = out.metadata();
        assert_eq!(meta.len(), 1);
        assert!(meta[0].err().expect("err").to_string().contains("draining"));
        assert!(out.producer_done_called());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_finishes_every_unconnected_inbound_stream() {
        let flow_id = FlowId::new_v4();
        let config = FlowConfig {
            row_channel_buffer_size: 1,
            flow_stream_timeout: std::time::Duration::from_secs(3600),
            ..FlowConfig::default()
        };
        let ctx = FlowCtx::new(flow_id, Arc::new(config));

        // Two unconnected inbound streams feeding one merged input.
        let spec = FlowSpec {
            flow_id,
            processors: vec![ProcessorSpec {
                processor_id: ProcessorId(1),
                core: ProcessorCoreUnion::Noop,
                post: PostProcessSpec::default(),
                inputs: vec![InputSyncSpec {
                    types: vec![ColumnType::Int],
                    streams: vec![
                        StreamEndpointSpec::Remote {
                            stream_id: StreamId(1),
                            target_node: NodeId(0),
                        },
                        StreamEndpointSpec::Remote {
                            stream_id: StreamId(2),
                            target_node: NodeId(0),
                        },
                    ],
                }],
                output: StreamEndpointSpec::SyncResponse,
            }],
        };
        let registry = FlowRegistry::new(NodeId(0));
        let out = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
        let mut flow = Flow::setup(
            ctx,
            &spec,
            registry.clone(),
            Arc::new(LocalDialer::new()),
            Some(out.clone()),
        )
        .expect("setup");
        flow.start().expect("start");
        assert_eq!(registry.num_registered_flows(), 1);

        flow.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), flow.wait())
            .await
            .expect("flow finishes after cancel");
        flow.cleanup();
        flow.cleanup();
        assert_eq!(registry.num_registered_flows(), 0);
        let errs: Vec<_> = out
            .metadata()
            .into_iter()
            .filter_map(|m| m.err().cloned())
            .collect();
        // One error per canceled stream, both forwarded by the noop.
        assert_eq!(
            errs,
            vec![RowflowError::QueryCanceled, RowflowError::QueryCanceled]
        );
        assert!(out.producer_done_called());
    }
}
