use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use rowflow_common::logging::init_tracing;
use rowflow_common::FlowConfig;
use rowflow_distributed::grpc::{parse_peers, FlowServiceServer, FlowStreamService, GrpcDialer};
use rowflow_distributed::NodeServer;
use tonic::transport::Server;
use tracing::info;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let config = FlowConfig::from_env()?;
    let bind = env_or_default("ROWFLOW_BIND", "0.0.0.0:7070");
    let addr: SocketAddr = bind.parse()?;
    let peers = parse_peers(&env_or_default("ROWFLOW_PEERS", ""))?;

    let node_id = config.node_id;
    let num_peers = peers.len();
    let server = Arc::new(NodeServer::new(config, Arc::new(GrpcDialer::new(peers)))?);
    info!(%node_id, %addr, peers = num_peers, "rowflow-node started");
    Server::builder()
        .add_service(FlowServiceServer::new(FlowStreamService::new(Arc::clone(&server))))
        .serve(addr)
        .await?;
    Ok(())
}
