//! Controller state wiring the engine to its SQLite gateway.

use std::path::PathBuf;
use std::sync::Arc;

use tasklane_core::TaskEngine;
use tasklane_infra::config::{load_engine_config, resolve_database_url};
use tasklane_infra::sqlite::pool::{default_data_dir, DatabasePool};
use tasklane_infra::sqlite::SqliteGateway;
use tasklane_types::config::EngineConfig;

/// The engine pinned to the SQLite gateway.
pub type Engine = TaskEngine<SqliteGateway>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load config from the data directory, open the database and build the
    /// engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        let pool = DatabasePool::open(&db_url, &config.storage).await?;
        tracing::info!(data_dir = %data_dir.display(), "database opened");

        Ok(Self::from_pool(pool, config, data_dir))
    }

    pub fn from_pool(pool: DatabasePool, config: EngineConfig, data_dir: PathBuf) -> Self {
        let gateway = Arc::new(SqliteGateway::new(pool));
        let engine = TaskEngine::new(gateway, config.clone());
        Self {
            engine: Arc::new(engine),
            config,
            data_dir,
        }
    }
}
