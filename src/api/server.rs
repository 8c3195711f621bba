use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::Router;
use tokio::signal;
use tracing::{info, error, debug};

use crate::api::routes;
use crate::api::types::ApiState;
use crate::config::ApiConfig;
use crate::error::Error;
use crate::mesh::MeshManager;
use crate::types::Result;

/// REST front end of the mesh manager
///
/// ```no_run
/// use std::sync::Arc;
/// use meshplane::api::ApiServer;
/// use meshplane::config::MeshConfig;
/// use meshplane::mesh::MeshManager;
/// use meshplane::telemetry::MeshMetrics;
///
/// #[tokio::main]
/// async fn main() -> meshplane::Result<()> {
///     let config = Arc::new(MeshConfig::default());
///     let manager = MeshManager::new(config.clone(), MeshMetrics::new()?).await?;
///
///     let server = ApiServer::new(manager.clone(), &config.api)?;
///     server.start_with_shutdown().await?;
///     manager.close().await
/// }
/// ```
pub struct ApiServer {
    /// Listening address
    address: SocketAddr,
    /// Router
    router: Router,
}

impl ApiServer {
    pub fn new(manager: Arc<MeshManager>, config: &ApiConfig) -> Result<Self> {
        let address = config
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid API address {:?}: {}", config.listen_addr, e)))?;

        let router = routes::create_router(ApiState::new(manager), &config.path_prefix);

        Ok(Self { address, router })
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn start_with_shutdown(&self) -> Result<()> {
        self.serve_until(Self::shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn serve_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting API server on {}", self.address);

        let server = axum::Server::try_bind(&self.address)
            .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", self.address, e)))?
            .serve(self.router.clone().into_make_service())
            .with_graceful_shutdown(shutdown);

        if let Err(e) = server.await {
            error!("API server error: {}", e);
            return Err(Error::Internal(format!("API server error: {}", e)));
        }

        info!("API server shut down gracefully");
        Ok(())
    }

    /// Wait for CTRL+C or SIGTERM
    async fn shutdown_signal() {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => debug!("Received Ctrl+C signal"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    debug!("Received SIGTERM signal");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received, starting graceful shutdown");
    }

    pub fn address(&self) -> &SocketAddr {
        &self.address
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }
}
