//! Coordinator configuration.
//!
//! Plain struct with defaults; deserializable from a JSON document whose
//! keys are the recognized option names (`query.max-age`,
//! `memory.general-pool-size`, ...). Durations are carried as seconds in
//! the file format.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoordError, Result};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Port for the statement HTTP surface.
    #[serde(rename = "http-server.port", default = "default_http_port")]
    pub http_port: u16,

    /// Grace window for keeping completed query state, in seconds.
    #[serde(rename = "query.max-age", default = "default_max_age_secs")]
    pub query_max_age_secs: u64,

    /// Cap on the number of completed queries retained.
    #[serde(rename = "query.max-history", default = "default_max_history")]
    pub query_max_history: usize,

    /// Maximum interval without a client poll before a query is
    /// considered abandoned, in seconds.
    #[serde(rename = "query.client-timeout", default = "default_client_timeout_secs")]
    pub query_client_timeout_secs: u64,

    /// Worker threads for the management runtime (sweeper, purger,
    /// listener fan-out).
    #[serde(
        rename = "query.manager-executor-pool-size",
        default = "default_manager_pool_size"
    )]
    pub query_manager_executor_pool_size: usize,

    /// Path to the admission queue rule definitions. When absent a
    /// single permissive `global` queue is installed.
    #[serde(rename = "query.queue-config-file", default)]
    pub query_queue_config_file: Option<PathBuf>,

    #[serde(rename = "memory.general-pool-size", default = "default_general_pool")]
    pub memory_general_pool_bytes: u64,

    #[serde(rename = "memory.reserved-pool-size", default = "default_reserved_pool")]
    pub memory_reserved_pool_bytes: u64,

    /// Per-query cluster-wide memory cap.
    #[serde(rename = "query.max-memory", default = "default_query_max_memory")]
    pub query_max_memory_bytes: u64,

    /// Per-query per-node memory cap, reported to workers.
    #[serde(
        rename = "query.max-memory-per-node",
        default = "default_query_max_memory_per_node"
    )]
    pub query_max_memory_per_node_bytes: u64,
}

fn default_http_port() -> u16 {
    8080
}

fn default_max_age_secs() -> u64 {
    15 * 60
}

fn default_max_history() -> usize {
    100
}

fn default_client_timeout_secs() -> u64 {
    5 * 60
}

fn default_manager_pool_size() -> usize {
    5
}

fn default_general_pool() -> u64 {
    8 * GIB
}

fn default_reserved_pool() -> u64 {
    2 * GIB
}

fn default_query_max_memory() -> u64 {
    2 * GIB
}

fn default_query_max_memory_per_node() -> u64 {
    GIB
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            query_max_age_secs: default_max_age_secs(),
            query_max_history: default_max_history(),
            query_client_timeout_secs: default_client_timeout_secs(),
            query_manager_executor_pool_size: default_manager_pool_size(),
            query_queue_config_file: None,
            memory_general_pool_bytes: default_general_pool(),
            memory_reserved_pool_bytes: default_reserved_pool(),
            query_max_memory_bytes: default_query_max_memory(),
            query_max_memory_per_node_bytes: default_query_max_memory_per_node(),
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CoordError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn query_max_age(&self) -> Duration {
        Duration::from_secs(self.query_max_age_secs)
    }

    pub fn query_client_timeout(&self) -> Duration {
        Duration::from_secs(self.query_client_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.query_max_history, 100);
        assert_eq!(config.query_client_timeout(), Duration::from_secs(300));
        assert_eq!(config.memory_general_pool_bytes, 8 * GIB);
        assert!(config.query_queue_config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "query.max-age": 60,
                "query.max-history": 7,
                "query.client-timeout": 10,
                "memory.general-pool-size": 1024
            }}"#
        )
        .unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(config.query_max_age(), Duration::from_secs(60));
        assert_eq!(config.query_max_history, 7);
        assert_eq!(config.memory_general_pool_bytes, 1024);
        // Unspecified options keep their defaults.
        assert_eq!(config.http_port, 8080);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"query.max-agee": 60}}"#).unwrap();
        assert!(CoordinatorConfig::load(file.path()).is_err());
    }
}
