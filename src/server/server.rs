//! Node server

use crate::cluster::{HashRing, QuorumCoordinator};
use crate::common::{NodeConfig, Result};
use crate::server::client::HttpReplicaClient;
use crate::server::http::{create_router, NodeState};
use crate::storage::Engine;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct NodeServer {
    config: NodeConfig,
}

impl NodeServer {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Open the storage engine and wire the ring, coordinator and router.
    pub fn build(&self) -> Result<(Router, Arc<Engine>)> {
        self.config.validate()?;
        let engine = Arc::new(Engine::open(self.config.storage.clone())?);
        let ring = Arc::new(HashRing::with_partitions(
            self.config.members(),
            self.config.node_id.clone(),
            self.config.replication.partitions,
        )?);
        let client = Arc::new(HttpReplicaClient::new(
            self.config.replication.replica_timeout(),
        )?);
        let coordinator = Arc::new(QuorumCoordinator::new(
            Arc::clone(&engine),
            ring,
            client,
            self.config.replication.replica_timeout(),
        ));
        let state = NodeState {
            engine: Arc::clone(&engine),
            coordinator,
        };
        Ok((create_router(state), engine))
    }

    /// Serve until Ctrl-C, then close the storage engine.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting node: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Cluster: {:?}", self.config.members());
        tracing::info!("  Data path: {}", self.config.storage.data_dir.display());

        let (router, engine) = self.build()?;
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let addr: SocketAddr = listener.local_addr()?;

        tracing::info!("✓ Node ready on {}", addr);

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            tracing::error!("HTTP server error: {}", e);
        }

        tracing::info!("Shutting down node {}", self.config.node_id);
        let closed = tokio::task::spawn_blocking(move || engine.close()).await;
        match closed {
            Ok(result) => result,
            Err(e) => Err(crate::Error::Internal(format!("close task failed: {}", e))),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
