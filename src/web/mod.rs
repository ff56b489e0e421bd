//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::events::EventBus;
use crate::probe::Prober;
use crate::scheduler::MonitoringEngine;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub engine: MonitoringEngine,
    pub bus: EventBus,
    pub prober: Arc<dyn Prober>,
}

/// Web server for turnwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        engine: MonitoringEngine,
        bus: EventBus,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                engine,
                bus,
                prober,
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
            .route("/api/health", get(handlers::handle_health))
            // Devices
            .route(
                "/api/devices",
                get(handlers::handle_get_devices).post(handlers::handle_create_device),
            )
            .route(
                "/api/devices/{device_id}",
                get(handlers::handle_get_device)
                    .put(handlers::handle_update_device)
                    .delete(handlers::handle_delete_device),
            )
            // Monitoring control
            .route("/api/monitoring/status", get(handlers::handle_monitoring_status))
            .route("/api/monitoring/start", post(handlers::handle_monitoring_start))
            .route("/api/monitoring/stop", post(handlers::handle_monitoring_stop))
            .route("/api/monitoring/ping-now", post(handlers::handle_ping_now))
            .route("/api/monitoring/reload-config", post(handlers::handle_reload_config))
            // Events
            .route("/api/events/stream", get(handlers::handle_event_stream))
            .route("/api/events/recent", get(handlers::handle_recent_events))
            .route("/api/events/category", post(handlers::handle_category_event))
            // Ad-hoc probe
            .route("/api/ping/ip/{ip}", get(handlers::handle_ping_ip))
            .route("/api/ping/device/{device_id}", get(handlers::handle_ping_device))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}
