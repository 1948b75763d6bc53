//! Web server module: read-only status API.

mod handlers;

pub use handlers::*;

use crate::db::Store;
use crate::scheduler::{MonitorHealth, StatusBoard, TargetRegistry};

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TargetRegistry>,
    pub store: Arc<Store>,
    pub board: Arc<StatusBoard>,
    pub health: Arc<MonitorHealth>,
}

/// Web server for the status API.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, state: AppState) -> Self {
        Self { port, state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/status", get(handlers::handle_status))
            .route("/api/history/{name}", get(handlers::handle_history))
            .route("/api/alerts", get(handlers::handle_alerts))
            .route("/api/health", get(handlers::handle_health))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` flips.
    pub async fn start(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        Ok(())
    }
}
