use backup_engine::config::AppConfig;
use backup_engine::db::connection::{close_pool, create_pool};
use backup_engine::db::migrate::migrate;
use backup_engine::routes;
use backup_engine::services::scheduler::BackupScheduler;
use backup_engine::state::AppState;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting backup engine on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.backup_root)?;

    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool, &config.data_dir)?;

    let state = Arc::new(AppState::new(pool, config.clone())?);
    tracing::info!(
        backup_root = %config.backup_root.display(),
        transport = ?config.transport,
        hooks = ?state.hooks.names(),
        workers = config.max_concurrent_global,
        purge = ?config.purge_schedule,
        "Engine ready"
    );

    let cancel = CancellationToken::new();
    let scheduler = BackupScheduler::new(state.clone());
    if let Err(e) = scheduler.init_schedules().await {
        tracing::warn!("Failed to initialize schedules: {}", e);
    }
    let scheduler_task = scheduler.start(cancel.clone());

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    let active = state.leases.active_count();
    if active > 0 {
        tracing::warn!(active, "Exiting with backups still running; they will be reset on next start");
    }

    close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
