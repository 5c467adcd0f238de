//! Coordinator server

use crate::common::{Config, Result};
use crate::coordinator::http::{create_router, CoordState};
use crate::rpc::HttpTransport;
use crate::store::RocksStore;
use crate::trans::{start_response_loop, start_sweeper, TransManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let coord = &self.config.coordinator;
        tracing::info!("Starting coordinator: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", coord.bind_addr);
        tracing::info!("  DB path: {}", coord.db_path.display());
        tracing::info!(
            "  Action retries: {} (backoff {}..{} ms)",
            self.config.trans.max_action_attempts,
            self.config.trans.retry_backoff_ms,
            self.config.trans.retry_backoff_max_ms
        );

        // Initialize metadata store
        let store = Arc::new(RocksStore::open(&coord.db_path)?);

        // Worker RPC transport; replies come back on the channel
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(HttpTransport::new(
            reply_tx,
            Duration::from_millis(self.config.trans.response_timeout_ms),
        )?);

        let manager = Arc::new(TransManager::new(
            self.config.trans.clone(),
            store.clone(),
            transport,
        )?);
        let restored = manager.init_trans()?;
        tracing::info!("  Restored transactions: {}", restored);

        let sweeper = start_sweeper(manager.clone());
        let responder = start_response_loop(manager.clone(), reply_rx);

        let router = create_router(CoordState {
            manager: manager.clone(),
            node_id: self.config.node_id.clone(),
        });
        let listener = tokio::net::TcpListener::bind(coord.bind_addr).await?;

        tracing::info!("✓ Coordinator ready");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }

        sweeper.abort();
        responder.abort();
        manager.cleanup_trans()?;
        if let Err(e) = store.flush() {
            tracing::warn!("store flush on shutdown failed: {}", e);
        }
        tracing::info!("Coordinator stopped");

        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
