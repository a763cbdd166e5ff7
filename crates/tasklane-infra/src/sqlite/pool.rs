//! SQLite connection pool for the engine.
//!
//! Every engine operation is one write transaction, and SQLite admits one
//! writer at a time, so the pool holds a single WAL-mode connection. Other
//! processes sharing the file wait up to the configured busy timeout for it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tasklane_types::config::StorageOptions;

#[derive(Clone)]
pub struct DatabasePool {
    /// The one connection engine transactions run on.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open `database_url` with default storage options.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::open(database_url, &StorageOptions::default()).await
    }

    /// Open the database, creating the file if needed, and apply pending
    /// migrations.
    pub async fn open(database_url: &str, options: &StorageOptions) -> Result<Self, sqlx::Error> {
        let connect = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(options.busy_timeout_secs))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        tracing::debug!(
            url = %database_url,
            busy_timeout_secs = options.busy_timeout_secs,
            "database pool opened"
        );
        Ok(Self { writer })
    }
}

/// Data directory from `TASKLANE_DATA_DIR`, falling back to `~/.tasklane`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("TASKLANE_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tasklane"),
    }
}
