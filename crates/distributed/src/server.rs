//! Per-node entry point: sets up flows and accepts inbound streams.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use rowflow_common::{FlowConfig, NodeId, Result, RowflowError};
use rowflow_execution::{FlowCtx, RowReceiver};
use tracing::{debug, info, warn};

use crate::flow::{Flow, FlowSpec};
use crate::inbound::InboundStreamHandler;
use crate::registry::FlowRegistry;
use crate::stream::{stream_pair, ClientStreamRef, FlowStreamServer, ServerStreamRef};

/// Opens flow streams to other nodes.
#[async_trait]
pub trait NodeDialer: Send + Sync {
    async fn dial(&self, node: NodeId) -> Result<ClientStreamRef>;
}

/// Hosts the flows of one node.
pub struct NodeServer {
    config: Arc<FlowConfig>,
    registry: FlowRegistry,
    dialer: Arc<dyn NodeDialer>,
}

impl std::fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("node_id", &self.config.node_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl NodeServer {
    pub fn new(config: FlowConfig, dialer: Arc<dyn NodeDialer>) -> Result<Self> {
        config.validate()?;
        let registry = FlowRegistry::new(config.node_id);
        Ok(Self {
            config: Arc::new(config),
            registry,
            dialer,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Build a flow whose outputs are all streams.
    pub fn setup_flow(&self, spec: &FlowSpec) -> Result<Flow> {
        self.setup(spec, None)
    }

    /// Build a flow with a [`crate::flow::StreamEndpointSpec::SyncResponse`]
    /// output delivered to `receiver`.
    pub fn setup_sync_flow(&self, spec: &FlowSpec, receiver: Arc<dyn RowReceiver>) -> Result<Flow> {
        self.setup(spec, Some(receiver))
    }

    fn setup(&self, spec: &FlowSpec, receiver: Option<Arc<dyn RowReceiver>>) -> Result<Flow> {
        let flow_ctx = FlowCtx::new(spec.flow_id, Arc::clone(&self.config));
        Flow::setup(
            flow_ctx,
            spec,
            self.registry.clone(),
            Arc::clone(&self.dialer),
            receiver,
        )
    }

    /// Serve one inbound stream until its producer is done.
    ///
    /// The first message must carry the stream header naming the consuming
    /// flow and stream.
    pub async fn flow_stream(&self, stream: ServerStreamRef) -> Result<()> {
        let first = stream.recv().await?.ok_or_else(|| {
            RowflowError::Connection("flow stream closed before its header".to_string())
        })?;
        let header = first.header.ok_or_else(|| {
            RowflowError::Connection("first flow stream message carries no header".to_string())
        })?;
        debug!(
            node_id = %self.config.node_id,
            flow_id = %header.flow_id,
            stream_id = %header.stream_id,
            "inbound stream arrived"
        );
        let connected = self
            .registry
            .connect_inbound_stream(
                header.flow_id,
                header.stream_id,
                &stream,
                self.config.flow_stream_timeout,
            )
            .await?;
        let res = connected
            .handler
            .run(&connected.flow_ctx, stream, first)
            .await;
        connected.cleanup.finish();
        if let Err(err) = &res {
            warn!(
                flow_id = %header.flow_id,
                stream_id = %header.stream_id,
                error = %err,
                "inbound stream failed"
            );
        }
        res
    }

    /// Wait for running flows using the configured drain timeouts, then
    /// reject new ones.
    pub async fn drain(&self) {
        let start = std::time::Instant::now();
        self.registry
            .drain(self.config.flow_drain_wait, self.config.min_flow_drain_wait)
            .await;
        info!(
            node_id = %self.config.node_id,
            remaining_flows = self.registry.num_registered_flows(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "node drained"
        );
    }

    pub fn undrain(&self) {
        self.registry.undrain();
    }
}

const LOCAL_STREAM_CAPACITY: usize = 16;

/// In-process dialer connecting node servers living in the same process.
///
/// Servers are held weakly; dialing a dropped server fails.
#[derive(Default)]
pub struct LocalDialer {
    nodes: RwLock<HashMap<NodeId, Weak<NodeServer>>>,
}

impl LocalDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, server: &Arc<NodeServer>) {
        self.nodes
            .write()
            .insert(server.node_id(), Arc::downgrade(server));
    }
}

#[async_trait]
impl NodeDialer for LocalDialer {
    async fn dial(&self, node: NodeId) -> Result<ClientStreamRef> {
        let server = self
            .nodes
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RowflowError::Connection(format!("unknown node {node}")))?;
        let (server_end, client_end) = stream_pair(LOCAL_STREAM_CAPACITY);
        tokio::spawn(async move {
            if let Err(err) = server.flow_stream(server_end).await {
                debug!(%node, error = %err, "local flow stream ended with error");
            }
        });
        Ok(client_end)
    }
}
