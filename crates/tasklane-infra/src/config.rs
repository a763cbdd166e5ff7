//! Engine configuration loader for Tasklane.
//!
//! Reads `config.toml` from the data directory (`~/.tasklane/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use tasklane_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Database URL to open: the configured one, else `{data_dir}/tasklane.db`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    match &config.database_url {
        Some(url) => url.clone(),
        None => format!("sqlite://{}?mode=rwc", data_dir.join("tasklane.db").display()),
    }
}
