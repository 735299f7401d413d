//! HTTP server for the admission sidecar.

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::handlers::{self, AppState};
use crate::error::Result;

/// Build the sidecar routes over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/admit", post(handlers::admit))
        .route("/v1/admin/whitelist", post(handlers::whitelist))
        .route("/v1/admin/blacklist", post(handlers::blacklist))
        .route("/v1/stats", get(handlers::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP server for the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Serve until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting admission HTTP server");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::clock::SystemClock;
    use crate::config::BouncerConfig;
    use crate::store::MemoryStore;
    use crate::telemetry::Telemetry;

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let config = BouncerConfig::default();
        let (telemetry, _) = Telemetry::spawn(&config.telemetry);
        let admission = Admission::from_config(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock::new()),
            telemetry,
        );
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, Arc::new(AppState { admission }));

        tokio_test::assert_ok!(server.serve_with_shutdown(async {}).await);
    }
}
