//! # Pathway Scheduler
//!
//! Runs the periodic overdue scan and delay monitor against PostgreSQL until
//! Ctrl-C. Several instances may run side by side; each tick is guarded by
//! an advisory lock.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use pathway_core::config::ConfigManager;
use pathway_core::engine::{DelayMonitor, OverdueReconciler, SystemClock, WorkflowEngine};
use pathway_core::logging::init_structured_logging_with_format;
use pathway_core::notifications::{ChannelKind, TracingChannel};
use pathway_core::services::{PeriodicLock, UserDirectory};
use pathway_core::store::{PgAdvisoryLock, PgUserDirectory, PgWorkflowStore, WorkflowStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("Failed to load configuration")?;
    let config = manager.config();
    init_structured_logging_with_format(config.logging.format);

    info!(
        environment = manager.environment(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting pathway scheduler"
    );

    let store = PgWorkflowStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    let pool = store.pool().clone();

    let store: Arc<dyn WorkflowStore> = Arc::new(store);
    let directory: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(pool.clone()));
    let lock: Arc<dyn PeriodicLock> = Arc::new(PgAdvisoryLock::new(pool));

    let mut builder = WorkflowEngine::builder(config.clone(), store.clone())
        .directory(directory.clone())
        .clock(Arc::new(SystemClock));
    for kind in [ChannelKind::Email, ChannelKind::Push, ChannelKind::WebSocket] {
        builder = builder.channel(Arc::new(TracingChannel::new(kind)));
    }
    let engine = Arc::new(builder.build());

    let reconciler = OverdueReconciler::new(
        config.overdue.clone(),
        store,
        directory,
        engine.dispatcher().clone(),
        lock.clone(),
        engine.clock().clone(),
    );
    let monitor = DelayMonitor::new(config.delays.clone(), engine, lock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    tokio::join!(reconciler.run(shutdown_rx.clone()), monitor.run(shutdown_rx));
    signal.abort();

    info!("Pathway scheduler stopped");
    Ok(())
}
