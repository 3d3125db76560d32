use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mothership_inventory::{Connection, DefaultInventory, SharedInventory};
use mothership_scheduler::{
    build_router, Bookkeeper, CallbackApiState, Cleaner, ClusterStatusTransition,
    DefaultReconciliationRepository, InMemoryOperationsRegistry, InventoryWatcher,
    OperationsRegistry, ReconciliationHandler, RemoteScheduler, RemoteWorkerFactory,
    SchedulerConfig, StorageBackend,
};

const DEFAULT_SQLITE_DB: &str = "mothership.db";
#[cfg(feature = "kernel-postgres")]
const POSTGRES_MAX_CONNECTIONS: u32 = 10;

fn open_connection(config: &SchedulerConfig) -> Result<Arc<dyn Connection + Send + Sync>> {
    match config.backend {
        StorageBackend::Sqlite => open_sqlite(&config.sqlite_db_path),
        StorageBackend::Postgres => {
            let dsn = config
                .postgres_dsn
                .as_deref()
                .ok_or_else(|| anyhow!("postgres backend without dsn"))?;
            open_postgres(dsn)
        }
    }
}

#[cfg(feature = "sqlite-persistence")]
fn open_sqlite(path: &str) -> Result<Arc<dyn Connection + Send + Sync>> {
    Ok(Arc::new(mothership_inventory::SqliteConnection::open(path)?))
}

#[cfg(not(feature = "sqlite-persistence"))]
fn open_sqlite(_path: &str) -> Result<Arc<dyn Connection + Send + Sync>> {
    Err(anyhow!(
        "sqlite backend requires the sqlite-persistence feature"
    ))
}

#[cfg(feature = "kernel-postgres")]
fn open_postgres(dsn: &str) -> Result<Arc<dyn Connection + Send + Sync>> {
    Ok(Arc::new(mothership_inventory::PostgresConnection::new(
        dsn,
        POSTGRES_MAX_CONNECTIONS,
    )?))
}

#[cfg(not(feature = "kernel-postgres"))]
fn open_postgres(_dsn: &str) -> Result<Arc<dyn Connection + Send + Sync>> {
    Err(anyhow!(
        "postgres backend requires the kernel-postgres feature"
    ))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,mothership_scheduler=info,mothership_inventory=info")
        }))
        .init();

    let config = SchedulerConfig::from_env(DEFAULT_SQLITE_DB).map_err(|e| anyhow!(e))?;
    let conn = open_connection(&config)?;
    let inventory: SharedInventory = Arc::new(DefaultInventory::new(conn.clone())?);
    let repository = Arc::new(DefaultReconciliationRepository::new(conn.clone()));
    let registry: Arc<dyn OperationsRegistry> = Arc::new(InMemoryOperationsRegistry::new());

    let factory = RemoteWorkerFactory::new(
        config.reconciler_registry()?,
        config.callback.clone(),
        registry.clone(),
        config.worker.clone(),
    )?;
    let handler = Arc::new(ReconciliationHandler::new(
        Arc::new(factory),
        config.component_order(),
    ));
    let transition = Arc::new(ClusterStatusTransition::new(
        conn,
        inventory.clone(),
        repository,
        config.transition_config(),
    ));
    let bookkeeper = Bookkeeper::new(
        transition.clone(),
        registry.clone(),
        config.bookkeeper.clone(),
    )?;
    let cleaner = Cleaner::new(transition.clone(), config.cleaner.clone())?;
    let watcher = InventoryWatcher::new(inventory, config.watch_config());
    let scheduler = RemoteScheduler::new(
        watcher,
        transition,
        handler,
        registry.clone(),
        config.remote_scheduler_config(),
    )?;

    let cancel = CancellationToken::new();
    let scheduling = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });
    let bookkeeping = tokio::spawn({
        let cancel = cancel.clone();
        async move { bookkeeper.run(cancel).await }
    });
    let cleaning = tokio::spawn({
        let cancel = cancel.clone();
        async move { cleaner.run(cancel).await }
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(build_router(CallbackApiState::new(registry)));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        "mothership server listening on http://{} backend={:?} pool_size={}",
        config.listen_addr,
        config.backend,
        config.pool_size
    );

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("shutdown_signal_failed error={}", e);
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    scheduling.await??;
    bookkeeping.await??;
    cleaning.await??;
    tracing::info!("mothership server stopped");
    Ok(())
}
