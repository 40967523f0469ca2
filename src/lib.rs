pub mod cluster;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use cluster::{AlwaysWritable, FlagWriteGuard, WriteGuard};
pub use error::{MeshError, MeshResult};

pub use logic::{
    BranchAssignment, JobQueue, MicroschemaUsageHasher, MigrationExecutor, MigrationWorker, SchemaDiff,
    SchemaManager, SchemaRegistry, VersionChain,
};

// Export all model types
pub use model::*;

pub use store::{CompiledSchema, MemoryStore, PostgresStore, SchemaCache, Store};

use std::sync::Arc;

use crate::config::{AppConfig, StoreBackend};

/// Info by default with sqlx held at warn, overridable through `RUST_LOG`.
/// Later calls keep the logger installed first.
pub fn init_logging() {
    // sqlx logs every statement at info
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .parse_default_env()
        .try_init();
}

/// Load configuration, open the configured store and run migration workers
/// until ctrl-c
pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: backend={:?}, workers={}, bucket_size={}",
        config.database.backend,
        config.migration.worker_count,
        config.migration.bucket_size
    );

    match config.database.backend {
        StoreBackend::Memory => {
            log::warn!("Using the in-memory store, nothing survives a restart");
            run_with_store(Arc::new(MemoryStore::new()), &config).await
        }
        StoreBackend::Postgres => {
            log::info!("Connecting to PostgreSQL");
            let store = PostgresStore::new(&config.database_url()?, config.max_connections()).await?;
            store.migrate().await?;
            run_with_store(Arc::new(store), &config).await
        }
    }
}

/// Run migration workers over `store` until ctrl-c
pub async fn run_with_store<S: Store + 'static>(store: Arc<S>, config: &AppConfig) -> anyhow::Result<()> {
    let manager = SchemaManager::new(store, &config.migration);
    let guard = Arc::new(FlagWriteGuard::new(config.cluster.write_allowed));
    let worker = MigrationWorker::spawn(manager.executor(), guard, &config.migration);

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested, waiting for running jobs");
    worker.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        // A logger is already installed: no panic
        init_logging();
        log::info!("logging initialized");
    }
}
