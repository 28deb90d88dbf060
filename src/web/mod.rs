//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::roster::TopologySource;
use crate::run::{EventBus, RunController, RunLogs};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub controller: RunController,
    pub bus: EventBus,
    pub logs: Arc<RunLogs>,
    pub topology: TopologySource,
}

/// Web server for the dashboard and its control API.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        controller: RunController,
        bus: EventBus,
        logs: Arc<RunLogs>,
        topology: TopologySource,
    ) -> Self {
        Self {
            state: AppState {
                config,
                controller,
                bus,
                logs,
                topology,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Dashboard
            .route("/", get(handlers::handle_dashboard))
            .route("/static/{*path}", get(handlers::handle_static))
            // Catalog and status
            .route("/api/tests", get(handlers::handle_get_tests))
            .route("/api/test_status", get(handlers::handle_all_status))
            .route("/api/test_status/{test_type}", get(handlers::handle_test_status))
            // Run control
            .route("/api/start_test", post(handlers::handle_start_test))
            .route("/api/stop_test", post(handlers::handle_stop_test))
            .route("/api/pause_test", post(handlers::handle_pause_test))
            .route("/api/resume_test", post(handlers::handle_resume_test))
            .route("/api/retest_device", post(handlers::handle_retest_device))
            .route("/api/regenerate_report", post(handlers::handle_regenerate_report))
            // Live events
            .route("/api/events", get(handlers::handle_events))
            // Files
            .route("/api/reports/{test_type}/latest", get(handlers::handle_latest_report))
            .route("/api/logs/{test_type}", get(handlers::handle_logs))
            // Mesh
            .route("/api/wisun_tree", get(handlers::handle_wisun_tree))
            // Static assets
            .route("/favicon.ico", get(handlers::handle_favicon))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
