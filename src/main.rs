//! turnwatch - turnstile reachability monitor.
//!
//! Probes every enabled device on an interval, debounces status changes and
//! streams them to dashboards and a chat notifier.

mod config;
mod db;
mod events;
mod notifier;
mod probe;
mod scheduler;
mod web;

use config::{ServerConfig, SettingsFile};
use db::Store;
use events::{EventBus, HEARTBEAT_INTERVAL};
use notifier::{Notifier, TelegramSink};
use probe::{IcmpProber, Prober};
use scheduler::MonitoringEngine;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("turnwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting turnwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Without any way to probe there is nothing to monitor
    let icmp = IcmpProber::detect()?;
    tracing::info!("ICMP probing via {:?}", icmp.capability());
    let prober: Arc<dyn Prober> = Arc::new(icmp);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let bus = EventBus::new();
    let heartbeat = bus.spawn_heartbeat(HEARTBEAT_INTERVAL);

    let settings = Arc::new(SettingsFile::new(cfg.config_path.clone(), cfg.monitor));
    let engine = MonitoringEngine::new(store.clone(), prober.clone(), settings, bus.clone());

    let notifier = match &cfg.telegram {
        Some(telegram) if !telegram.chat_ids.is_empty() => {
            let sink = Arc::new(TelegramSink::new(&telegram.token)?);
            Some(Notifier::new(sink, telegram.chat_ids.clone()).spawn(&bus))
        }
        Some(_) => {
            tracing::warn!("Telegram token set but no chat ids configured, notifier disabled");
            None
        }
        None => None,
    };

    engine.start().await;

    let server = Server::new(cfg, store, engine.clone(), bus.clone(), prober);
    let shutdown_bus = bus.clone();
    let served = server
        .start(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            // Ends open event streams so the server can drain
            shutdown_bus.close();
        })
        .await;

    engine.stop().await;
    bus.close();
    let _ = heartbeat.await;
    if let Some(notifier) = notifier {
        let _ = notifier.await;
    }
    tracing::info!("turnwatch stopped");

    served
}
