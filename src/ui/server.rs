//! Local control server
//!
//! Serves the status routes and the control WebSocket on the loopback
//! interface by default. Losing every client is normal; the node keeps
//! running and accepts new connections.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::config::UiConfig;
use crate::node::Node;
use crate::ui::{handlers, websocket};

/// Shared state of every route
pub struct AppState {
    pub node: Arc<Node>,
}

/// HTTP + WebSocket server of the local control channel
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, node: Arc<Node>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/peers", get(handlers::get_peers))
            .route("/api/library", get(handlers::get_library))
            .route("/api/sessions", get(handlers::get_sessions))
            .route("/api/zones", get(handlers::get_zones))
            .route("/api/zones/:id", get(handlers::get_zone))
            .route("/api/zones/:id/:action", post(handlers::zone_action))
            .route("/ws", get(websocket::ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails
    pub async fn run(self) -> crate::Result<()> {
        let listener = tokio::net::TcpListener::bind((self.config.bind_address.as_str(), self.config.http_port)).await?;
        tracing::info!("Control channel listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Control server stopped: {}", e);
            }
        })
    }
}
