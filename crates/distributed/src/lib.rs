//! Distributed side of rowflow: flows spanning nodes and the streams between
//! them.
//!
//! Architecture role:
//! - [`registry`]: node-wide rendezvous between registered flows and their
//!   inbound streams, with timeouts, cancellation and draining
//! - [`flow`]: builds and runs the processors of one node-local flow
//! - [`outbox`] / [`inbox`]: columnar producer and consumer ends of a stream
//! - [`server`]: per-node entry point and in-process dialing
//! - `grpc` (feature `grpc`): tonic transport for flow streams

pub mod flow;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod inbound;
pub mod inbox;
pub mod outbox;
pub mod registry;
pub mod server;
pub mod stream;

pub use flow::{Flow, FlowSpec, InputSyncSpec, ProcessorSpec, StreamEndpointSpec};
pub use inbound::{CancelSignal, InboundStreamHandler, RowInboundStreamHandler};
pub use inbox::Inbox;
pub use outbox::{CancelFn, Outbox};
pub use registry::{
    ConnectedStream, FlowRegistry, InboundStreamInfo, InboundStreamStatus, RegistryTestingKnobs,
    StreamCleanup,
};
pub use server::{LocalDialer, NodeDialer, NodeServer};
pub use stream::{
    stream_pair, ClientStreamRef, ConsumerHandshake, ConsumerSignal, FlowStreamClient,
    FlowStreamServer, ProducerMessage, ServerStreamRef, StreamHeader,
};
