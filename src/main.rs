use std::sync::Arc;
use anyhow::{Context, Result};
use meshplane::{
    api::ApiServer,
    config::load_config,
    mesh::MeshManager,
    telemetry::{init_logging, MeshMetrics},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Environment from .env, if present
    dotenvy::dotenv().ok();

    // 2. Load configuration and initialize logging
    let config = Arc::new(load_config(None).context("loading configuration")?);
    init_logging(&config.logging)?;
    info!("Starting meshplane {}...", env!("CARGO_PKG_VERSION"));

    if !config.enabled {
        info!("Mesh disabled by configuration; sidecars will not be injected");
    }

    // 3. Restore the registry and start background tasks
    let metrics = MeshMetrics::new()?;
    let manager = MeshManager::new(config.clone(), metrics)
        .await
        .context("starting mesh manager")?;

    // 4. Serve the REST API until a shutdown signal arrives
    let server = ApiServer::new(manager.clone(), &config.api)?;
    info!("Meshplane listening on {}", server.address());
    if let Err(e) = server.start_with_shutdown().await {
        error!("API server failed: {}", e);
    }

    // 5. Stop sidecars and background tasks
    manager.close().await?;
    info!("Meshplane stopped");

    Ok(())
}
