//! Exporter HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use delpro_metrics::MetricSet;
use delpro_source::RecordSource;

use crate::config::ExporterConfig;
use crate::error::{ExporterError, ExporterResult};
use crate::routes::create_router;
use crate::state::ExporterState;

/// HTTP server for the live and historical endpoints.
#[derive(Debug, Clone)]
pub struct ExporterServer {
    state: Arc<ExporterState>,
}

impl ExporterServer {
    /// Create a server over the live set and a record source.
    #[must_use]
    pub fn new(config: ExporterConfig, live: MetricSet, source: Arc<dyn RecordSource>) -> Self {
        Self {
            state: Arc::new(ExporterState::new(config, live, source)),
        }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<ExporterState> {
        self.state.clone()
    }

    /// Start the server and listen for connections.
    ///
    /// This method runs until the server encounters a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve(&self, addr: SocketAddr) -> ExporterResult<()> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server will shut down when the provided future completes.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, addr: SocketAddr, shutdown: F) -> ExporterResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ExporterError::BindFailed(addr, e))?;

        info!(addr = %addr, "exporter listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ExporterError::Internal(e.to_string()))?;

        info!("exporter shut down");
        Ok(())
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }
}
