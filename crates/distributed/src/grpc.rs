//! gRPC transport for flow streams.
//!
//! RPC schema source: `proto/rowflow.proto`. The single bidirectional
//! `FlowStream` RPC carries JSON-encoded [`ProducerMessage`]s from the outbox
//! (client) and [`ConsumerSignal`]s back from the node hosting the consumer.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rowflow_common::{NodeId, Result, RowflowError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::server::{NodeDialer, NodeServer};
use crate::stream::{
    ClientStreamRef, ConsumerSignal, FlowStreamClient, FlowStreamServer, ProducerMessage,
};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("rowflow.v1");
}

pub use v1::flow_service_client::FlowServiceClient;
pub use v1::flow_service_server::{FlowService, FlowServiceServer};

const GRPC_STREAM_BUFFER: usize = 16;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| RowflowError::Execution(format!("flow stream encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| RowflowError::Execution(format!("flow stream decode failed: {e}")))
}

fn to_status(err: RowflowError) -> Status {
    match err {
        RowflowError::InvalidConfig(msg) => Status::invalid_argument(msg),
        RowflowError::Planning(msg) => Status::failed_precondition(msg),
        RowflowError::QueryCanceled => Status::cancelled(RowflowError::QueryCanceled.to_string()),
        RowflowError::Connection(msg) => Status::unavailable(msg),
        err @ RowflowError::ResourceExhausted { .. } => Status::resource_exhausted(err.to_string()),
        RowflowError::Unsupported(msg) => Status::unimplemented(msg),
        err => Status::internal(err.to_string()),
    }
}

fn from_status(status: Status) -> RowflowError {
    match status.code() {
        tonic::Code::Cancelled => RowflowError::QueryCanceled,
        _ => RowflowError::Connection(format!("flow stream rpc failed: {}", status.message())),
    }
}

/// Server half of a gRPC flow stream.
struct GrpcServerStream {
    inbound: Mutex<Streaming<v1::ProducerEnvelope>>,
    outbound: mpsc::Sender<std::result::Result<v1::ConsumerEnvelope, Status>>,
}

#[async_trait]
impl FlowStreamServer for GrpcServerStream {
    async fn send(&self, signal: ConsumerSignal) -> Result<()> {
        let payload = encode(&signal)?;
        self.outbound
            .send(Ok(v1::ConsumerEnvelope { payload }))
            .await
            .map_err(|_| RowflowError::Connection("flow stream response closed".to_string()))
    }

    async fn recv(&self) -> Result<Option<ProducerMessage>> {
        let env = self.inbound.lock().await.message().await.map_err(from_status)?;
        env.map(|env| decode(&env.payload)).transpose()
    }
}

/// `FlowService` implementation serving inbound streams of one node.
#[derive(Clone)]
pub struct FlowStreamService {
    server: Arc<NodeServer>,
}

impl FlowStreamService {
    pub fn new(server: Arc<NodeServer>) -> Self {
        Self { server }
    }
}

#[tonic::async_trait]
impl FlowService for FlowStreamService {
    type FlowStreamStream =
        Pin<Box<dyn Stream<Item = std::result::Result<v1::ConsumerEnvelope, Status>> + Send>>;

    async fn flow_stream(
        &self,
        request: Request<Streaming<v1::ProducerEnvelope>>,
    ) -> std::result::Result<Response<Self::FlowStreamStream>, Status> {
        let (tx, rx) = mpsc::channel(GRPC_STREAM_BUFFER);
        let errors = tx.clone();
        let stream = Arc::new(GrpcServerStream {
            inbound: Mutex::new(request.into_inner()),
            outbound: tx,
        });
        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            if let Err(err) = server.flow_stream(stream).await {
                debug!(error = %err, "grpc flow stream failed");
                let _ = errors.send(Err(to_status(err))).await;
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Client half of a gRPC flow stream.
struct GrpcClientStream {
    outbound: Mutex<Option<mpsc::Sender<v1::ProducerEnvelope>>>,
    inbound: Mutex<Streaming<v1::ConsumerEnvelope>>,
}

#[async_trait]
impl FlowStreamClient for GrpcClientStream {
    async fn send(&self, msg: ProducerMessage) -> Result<()> {
        let payload = encode(&msg)?;
        let tx = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| RowflowError::Connection("flow stream send side closed".to_string()))?;
        tx.send(v1::ProducerEnvelope { payload })
            .await
            .map_err(|_| RowflowError::Connection("flow stream request closed".to_string()))
    }

    async fn recv(&self) -> Result<Option<ConsumerSignal>> {
        let env = self.inbound.lock().await.message().await.map_err(from_status)?;
        env.map(|env| decode(&env.payload)).transpose()
    }

    async fn close_send(&self) -> Result<()> {
        self.outbound.lock().await.take();
        Ok(())
    }
}

/// Dials other nodes over gRPC using a static address book.
#[derive(Debug, Clone, Default)]
pub struct GrpcDialer {
    endpoints: HashMap<NodeId, String>,
}

impl GrpcDialer {
    pub fn new(endpoints: HashMap<NodeId, String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl NodeDialer for GrpcDialer {
    async fn dial(&self, node: NodeId) -> Result<ClientStreamRef> {
        let endpoint = self
            .endpoints
            .get(&node)
            .cloned()
            .ok_or_else(|| RowflowError::Connection(format!("no address for node {node}")))?;
        let mut client: FlowServiceClient<Channel> = FlowServiceClient::connect(endpoint.clone())
            .await
            .map_err(|e| RowflowError::Connection(format!("dial {endpoint} failed: {e}")))?;
        let (tx, rx) = mpsc::channel(GRPC_STREAM_BUFFER);
        let response = client
            .flow_stream(ReceiverStream::new(rx))
            .await
            .map_err(from_status)?;
        debug!(%node, %endpoint, "flow stream opened");
        Ok(Arc::new(GrpcClientStream {
            outbound: Mutex::new(Some(tx)),
            inbound: Mutex::new(response.into_inner()),
        }))
    }
}

/// Parse an address book of the form `1=http://a:7000,2=http://b:7000`.
pub fn parse_peers(spec: &str) -> Result<HashMap<NodeId, String>> {
    let mut peers = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, addr) = entry.split_once('=').ok_or_else(|| {
            RowflowError::InvalidConfig(format!("peer entry '{entry}' is not id=address"))
        })?;
        let id = id.trim().parse::<u32>().map_err(|e| {
            RowflowError::InvalidConfig(format!("peer entry '{entry}' has a bad node id: {e}"))
        })?;
        if peers.insert(NodeId(id), addr.trim().to_string()).is_some() {
            warn!(node = id, "duplicate peer entry, keeping the last one");
        }
    }
    Ok(peers)
}
