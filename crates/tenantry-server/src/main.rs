//! Tenantry Server — process entry point.
//!
//! Wires the document store, the health monitor and the deferred-write
//! replay, then runs until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use tenantry_core::error::{TenantryError, TenantryResult};
use tenantry_db::repository::SurrealDocumentStore;
use tenantry_db::{DbConfig, DbManager, run_migrations};
use tenantry_governance::{
    ConnectionHealthMonitor, ConnectivityStatus, DegradedWriteQueue, GovernanceConfig,
    RetryExecutor, TenantScopedStore, replay_deferred,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "tenantry_server=info,tenantry_governance=info,tenantry_db=info";

#[tokio::main]
async fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!("Starting Tenantry server...");

    match run().await {
        Ok(()) => {
            info!("Tenantry server stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Tenantry server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> TenantryResult<()> {
    let config = GovernanceConfig::from_env()?;
    let db_config = DbConfig::from_env();

    let db = DbManager::connect(&db_config).await?;
    run_migrations(&db.client()?).await?;

    let queue = match &config.store.deferred_queue_path {
        Some(path) => DegradedWriteQueue::open(path.clone()).await?,
        None => DegradedWriteQueue::in_memory(),
    };

    let status = ConnectivityStatus::new();
    let store = Arc::new(
        TenantScopedStore::new(
            SurrealDocumentStore::new(db.clone()),
            RetryExecutor::new(status.clone()),
            &config.store,
        )
        .with_deferred_queue(queue),
    );

    let monitor = ConnectionHealthMonitor::with_pending_writes(
        db,
        status,
        config.monitor.clone(),
        store.pending_writes(),
    );
    let replay = tokio::spawn(replay_deferred(
        Arc::clone(&store),
        monitor.subscribe(),
        config.monitor.probe_interval,
    ));
    monitor.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| TenantryError::Internal(format!("failed to listen for shutdown: {e}")))?;
    info!("Shutdown signal received");

    monitor.stop().await;
    replay.abort();
    Ok(())
}
