use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vip_core::{CoreError, Engine};
use vip_ipam::PoolAllocator;
use vip_kube::{ConfigMapStore, KubeClient};

mod config;
mod service_controller;

use config::ControllerConfig;
use service_controller::ServiceController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting vip-controller...");

    let config = ControllerConfig::from_env()?;
    info!("  - Registry configMap: {}", config.config_map);
    info!(
        "  - Pool configMap: {}/{}",
        config.pool_config_namespace, config.pool_config_map
    );
    info!("  - Max attempts: {}", config.max_attempts);

    let client = KubeClient::new().await?;
    let store = Arc::new(ConfigMapStore::new(client.clone_client()));
    let allocator = Arc::new(PoolAllocator::new());
    let engine = Engine::new(store, allocator, config.engine_config());

    let namespaces = client
        .namespaces()
        .await
        .context("listing namespaces to restore allocations")?;
    restore_allocations(&engine, namespaces).await?;

    let cancel = CancellationToken::new();
    let controller = ServiceController::new(client.clone_client(), engine, config, cancel.clone());

    // Start Service reconciliation
    let mut handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("Service controller error: {}", e);
        }
    });

    // Keep the process alive
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining in-flight reconciles...");
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
        warn!("Reconciles still running after {:?}, aborting", SHUTDOWN_GRACE);
        handle.abort();
    }

    Ok(())
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Seed the allocator with every VIP already recorded in the cluster
///
/// A namespace whose registry cannot be read at all aborts startup: serving
/// with a partial allocator could hand out addresses that are already in use.
/// A corrupt registry is skipped, since nothing in it can be trusted anyway.
async fn restore_allocations(
    engine: &Engine,
    namespaces: impl IntoIterator<Item = String>,
) -> Result<usize> {
    let mut restored = 0;
    for namespace in namespaces {
        match engine.restore(&namespace).await {
            Ok(count) => restored += count,
            Err(e @ CoreError::CorruptRegistry { .. }) => {
                warn!(namespace = %namespace, "Skipping unreadable registry: {}", e)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("restoring allocations in {}", namespace))
            }
        }
    }
    info!("Restored {} allocations", restored);
    Ok(restored)
}
