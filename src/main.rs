//! Outproxy Guardian - health monitor for outproxy endpoints.
//!
//! Probes every configured proxy on a fixed interval, confirms failures with a
//! retest before alerting, and keeps an auditable history of every check.

mod alert;
mod config;
mod db;
mod probe;
mod scheduler;
mod web;

use alert::{AlertDispatcher, WebhookNotifier};
use config::{MonitorConfig, ServerConfig};
use db::Store;
use probe::HttpProxyProber;
use scheduler::{MonitorHealth, RetentionManager, Scheduler, TargetRegistry, WorkerContext};
use web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("outproxy_guardian=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting Outproxy Guardian on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let monitor_config = MonitorConfig::load(&cfg.config_path)?;
    tracing::info!(
        "Loaded {} targets from {}",
        monitor_config.targets.len(),
        cfg.config_path
    );

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let registry = Arc::new(TargetRegistry::new(monitor_config)?);
    let health = Arc::new(MonitorHealth::new(
        registry.snapshot().settings().check_interval(),
    ));

    let notifier = Arc::new(WebhookNotifier::new(WEBHOOK_TIMEOUT)?);
    let (alerts, _dispatcher) =
        AlertDispatcher::spawn(store.clone(), notifier, registry.clone(), health.clone());
    let requeued = alerts.requeue_pending(&store)?;
    if requeued > 0 {
        tracing::info!("Re-queued {} undelivered alerts", requeued);
    }

    let scheduler = Arc::new(Scheduler::new(WorkerContext {
        store: store.clone(),
        registry: registry.clone(),
        prober: Arc::new(HttpProxyProber::new()),
        alerts,
        health: health.clone(),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_reload_on_sighup(registry.clone(), cfg.config_path.clone());

    let retention = RetentionManager::new(store.clone(), registry.clone());
    retention.start().await;

    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let server = Server::new(
        cfg.http_port,
        AppState {
            registry,
            store,
            board: scheduler.board(),
            health,
        },
    );
    let server_task = tokio::spawn(async move { server.start(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    retention.stop().await;
    let _ = scheduler_task.await;
    match server_task.await {
        Ok(Err(e)) => tracing::error!("Web server failed: {}", e),
        Err(e) => tracing::error!("Web server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

/// Re-read the monitor config whenever the process receives SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_sighup(registry: Arc<TargetRegistry>, path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Config reload on SIGHUP unavailable: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match registry.reload_from(&path) {
                Ok(generation) => tracing::info!("Reloaded {} (generation {})", path, generation),
                Err(e) => tracing::warn!("Rejected reload of {}, keeping previous config: {}", path, e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_registry: Arc<TargetRegistry>, _path: String) {}
