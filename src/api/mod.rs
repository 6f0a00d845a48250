//! Device-facing HTTP edge
//!
//! Devices stream PCM16 audio over a WebSocket and receive transcripts and
//! response fragments back as JSON text messages.

pub mod device;
pub mod health;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::session::SessionManager;
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
}

/// Device edge server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
    shutdown: CancellationToken,
}

impl ApiServer {
    /// Server for `manager`, bound to the configured host and port
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let server = &manager.config().server;
        let (host, port) = (server.host.clone(), server.port);
        Self {
            state: Arc::new(ApiState { manager }),
            host,
            port,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the server and closes every session
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        Router::new()
            .merge(device::router(Arc::clone(&self.state)))
            .merge(health::router())
            .merge(health::status_router(Arc::clone(&self.state)))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and run until the shutdown token fires
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Run on an already-bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "voice gateway listening");

        let shutdown = self.shutdown.clone();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        let reports = self.state.manager.shutdown().await;
        tracing::info!(sessions = reports.len(), "voice gateway stopped");
        Ok(())
    }

    /// Run the server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
