//! Engine configuration types.
//!
//! `EngineConfig` is the `config.toml` of a Tasklane deployment. Every field
//! has a default so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite URL; falls back to `{data_dir}/tasklane.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Engine-level retries granted to an attempt that failed for reasons
    /// outside the task (lost worker lease, internal errors).
    #[serde(default = "default_max_internal_retry_count")]
    pub max_internal_retry_count: i32,

    /// Lease granted to a worker when an attempt is assigned.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,

    #[serde(default)]
    pub sweeps: SweepLimits,

    #[serde(default)]
    pub caches: CacheTtls,

    #[serde(default)]
    pub storage: StorageOptions,

    /// Minimum time between re-checks of a claimed idempotency key.
    #[serde(default = "default_idempotency_recheck_interval_secs")]
    pub idempotency_recheck_interval_secs: i64,

    /// Period of the controller's sweep ticker.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_max_internal_retry_count() -> i32 {
    3
}

fn default_lease_secs() -> i64 {
    60
}

fn default_idempotency_recheck_interval_secs() -> i64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    1
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_internal_retry_count: default_max_internal_retry_count(),
            lease_secs: default_lease_secs(),
            sweeps: SweepLimits::default(),
            caches: CacheTtls::default(),
            storage: StorageOptions::default(),
            idempotency_recheck_interval_secs: default_idempotency_recheck_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// Batch size of each periodic sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepLimits {
    #[serde(default = "default_sweep_limit")]
    pub timeouts: i64,
    #[serde(default = "default_sweep_limit")]
    pub reassignments: i64,
    #[serde(default = "default_sweep_limit")]
    pub retry_queue: i64,
    #[serde(default = "default_sweep_limit")]
    pub durable_sleeps: i64,
}

fn default_sweep_limit() -> i64 {
    1000
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            timeouts: default_sweep_limit(),
            reassignments: default_sweep_limit(),
            retry_queue: default_sweep_limit(),
            durable_sleeps: default_sweep_limit(),
        }
    }
}

/// Lifetimes of the process-local caches, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTtls {
    #[serde(default = "default_workflow_version_ttl")]
    pub workflow_versions_secs: u64,
    #[serde(default = "default_queue_ttl")]
    pub queues_secs: u64,
    #[serde(default = "default_expression_ttl")]
    pub expressions_secs: u64,
}

fn default_workflow_version_ttl() -> u64 {
    300
}

fn default_queue_ttl() -> u64 {
    60
}

fn default_expression_ttl() -> u64 {
    600
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            workflow_versions_secs: default_workflow_version_ttl(),
            queues_secs: default_queue_ttl(),
            expressions_secs: default_expression_ttl(),
        }
    }
}

/// SQLite connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// How long a write waits for another process's write to finish.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_internal_retry_count, 3);
        assert_eq!(config.sweeps.timeouts, 1000);
        assert_eq!(config.caches.queues_secs, 60);
        assert!(config.database_url.is_none());
        assert_eq!(config.storage.busy_timeout_secs, 5);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_partial() {
        let toml_str = r#"
max_internal_retry_count = 5
database_url = "sqlite::memory:"

[sweeps]
timeouts = 50

[caches]
expressions_secs = 10

[storage]
busy_timeout_secs = 30
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_internal_retry_count, 5);
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.sweeps.timeouts, 50);
        assert_eq!(config.sweeps.retry_queue, 1000);
        assert_eq!(config.caches.expressions_secs, 10);
        assert_eq!(config.caches.workflow_versions_secs, 300);
        assert_eq!(config.storage.busy_timeout_secs, 30);
    }
}
