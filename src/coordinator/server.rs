//! Coordinator server

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::machine::CoordinatorDeps;
use crate::coordinator::notifier::HttpRoutingNotifier;
use crate::coordinator::service::ReshardingService;
use crate::coordinator::store::RocksCatalogStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Coordinator {
    config: CoordinatorConfig,
    node_id: String,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting resharding coordinator: {}", self.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!("  Known shards: {}", self.config.shard_urls.len());

        let store = Arc::new(RocksCatalogStore::open(&self.config.db_path)?);
        let transport = Arc::new(HttpRoutingNotifier::new(
            self.config.shard_urls.clone(),
            self.config.notify_timeout(),
        )?);
        let deps = CoordinatorDeps::new(store, transport, self.config.retry);
        let service = ReshardingService::new(deps, self.config.gc_expiry());

        // Single coordinator node: the lease is taken at startup
        let resumed = service.step_up()?;
        tracing::info!("  Resumed operations: {}", resumed);

        let shutdown = CancellationToken::new();
        let sweeper = service.spawn_sweeper(self.config.sweep_interval(), shutdown.clone());

        let router = create_router(CoordState {
            service: service.clone(),
        });
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("✓ Coordinator ready");

        let res = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        service.step_down();
        shutdown.cancel();
        let _ = sweeper.await;

        if let Err(e) = res {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
