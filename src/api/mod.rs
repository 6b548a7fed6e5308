//! HTTP server for the proxy worker

pub mod health;

pub use health::Readiness;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::Result;

/// Health check server
pub struct HealthServer {
    port: u16,
    ready: Readiness,
}

impl HealthServer {
    #[must_use]
    pub const fn new(port: u16, ready: Readiness) -> Self {
        Self { port, ready }
    }

    /// Build the router with request tracing
    #[must_use]
    pub fn router(&self) -> Router {
        health::router(self.ready.clone()).layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` flips to `true`
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound or the server fails
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind health server: {e}")))?;

        tracing::info!(port = self.port, "health server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| crate::Error::Config(format!("health server error: {e}")))?;

        Ok(())
    }

    /// Run the server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
