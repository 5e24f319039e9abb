//! HTTP server that binds the admin router to a TCP socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::router::{build_router, AppState};
use super::service::AdminService;
use crate::error::{Result, TollboothError};

/// Axum-based HTTP server for the admin API.
pub struct AdminServer {
    pub(crate) addr: SocketAddr,
    pub(crate) state: AppState,
}

impl AdminServer {
    /// Creates a new admin server.
    ///
    /// * `addr`: address to listen on
    /// * `admin`: shared admin operations
    /// * `token`: optional Bearer token for authentication
    pub fn new(addr: SocketAddr, admin: Arc<AdminService>, token: Option<String>) -> Self {
        Self {
            addr,
            state: AppState { admin, token },
        }
    }

    /// Start the admin server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            auth = self.state.token.is_some(),
            "Admin API ready"
        );

        let router = build_router(self.state);
        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "Admin server failed");
                TollboothError::from(e)
            })
    }
}
