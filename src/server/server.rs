//! Relay HTTP server
//!
//! Serves the WebSocket endpoint, the health and status routes, and
//! optionally a directory of front-end assets.

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::error::{Error, NetworkError, Result};
use crate::relay::RelayState;
use crate::server::{handlers, websocket};

/// State shared by every request handler
pub struct AppState {
    pub relay: RelayState,
    pub config: RelayConfig,
}

/// Relay server
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: Arc::new(AppState {
                relay: RelayState::new(),
                config,
            }),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Build the router. Static files, when configured, only answer paths
    /// no route claims, so `/` always reports status.
    pub fn router(&self) -> Router {
        let config = &self.state.config;

        let router = Router::new()
            .route("/", get(handlers::get_status))
            .route("/health", get(handlers::health))
            .route("/api/status", get(handlers::get_status))
            .route(&config.ws_path, get(websocket::ws_handler));

        let router = match &config.static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir)),
            None => router,
        };

        router
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.state.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)).into())
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                "Relay listening on {} (WebSocket path {})",
                addr,
                self.state.config.ws_path
            );
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(Error::Io)
    }

    /// Serve on an already bound listener in the background
    pub fn start_background(self, listener: TcpListener) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.serve(listener, std::future::pending::<()>()).await })
    }
}
