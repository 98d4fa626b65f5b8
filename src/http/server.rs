//! HTTP server implementation.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers::{create_router, AppState};
use crate::error::{Result, TollboothError};

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared handler state
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server for rate limit service");

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollboothError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::ratelimit::RateLimiter;
    use crate::store::MemoryBucketStore;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let limiter =
            RateLimiter::new(10.0, 1.0, Arc::new(MemoryBucketStore::new()), metrics.clone())
                .unwrap();
        AppState::new(Arc::new(limiter), metrics, None)
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, test_state());

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_server_reports_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let result = HttpServer::new(addr, test_state())
            .serve_with_shutdown(async {})
            .await;
        assert!(matches!(result, Err(TollboothError::Io(_))));
    }
}
