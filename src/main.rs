use std::sync::Arc;

use tracing::info;

use reserva::cache::{CalendarCache, MemoryBackend};
use reserva::config::Config;
use reserva::engine::Engine;
use reserva::notify::{LogDispatcher, NotifyHub};
use reserva::repository::Repository;
use reserva::scheduler::Scheduler;
use reserva::store::WalStore;

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    reserva::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("reserva.wal");
    let notify = Arc::new(NotifyHub::new());
    let store: Arc<dyn Repository> =
        Arc::new(WalStore::open(&wal_path, notify, config.compact_threshold)?);

    let cache = CalendarCache::new(store.clone(), Arc::new(MemoryBackend::new()), config.cache_ttl);
    let (scheduler, worker) = Scheduler::new(config.scheduler);
    let engine = Arc::new(Engine::new(
        store,
        cache,
        Arc::new(LogDispatcher),
        scheduler.clone(),
        config.lifecycle,
    ));

    let dispatcher = worker.spawn(engine.clone());
    scheduler.schedule_sweeps(&config.sweeps);

    info!("reserva running");
    info!("  wal: {}", wal_path.display());
    info!("  workers: {}", config.scheduler.workers);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    shutdown_signal().await?;
    info!("shutdown signal received, stopping scheduler");
    scheduler.shutdown();
    if let Err(e) = dispatcher.await {
        tracing::error!("scheduler task failed: {e}");
    }

    info!("reserva stopped");
    Ok(())
}
