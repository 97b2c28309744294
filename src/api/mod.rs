//! Relay server: exposes the bridge to remote clients over WebSocket

pub mod health;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::realtime::{ConnectLimiter, Connector, WsConnector};
use crate::Result;

/// Shared state for API handlers
pub struct ApiState {
    pub config: Config,
    /// Opens one upstream link per relay session
    pub connector: Arc<dyn Connector>,
    /// Shared across sockets so reconnect storms from one peer are throttled
    pub limiter: ConnectLimiter,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            connector: None,
        }
    }

    /// Use a custom upstream connector instead of the configured endpoint
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the API server
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the upstream URL is invalid
    pub fn build(self) -> Result<ApiServer> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector::from_config(&self.config.upstream)?),
        };
        let limiter = ConnectLimiter::new(self.config.timing.min_connect_interval);

        Ok(ApiServer {
            state: Arc::new(ApiState {
                config: self.config,
                connector,
                limiter,
            }),
        })
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .merge(websocket::router(Arc::clone(&self.state)))
            .merge(health::router());

        // CORS layer for browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server on the configured address
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.server.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind relay server: {e}")))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "relay server listening");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| crate::Error::Config(format!("relay server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
