use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strand_core::handlers::HandlerRegistry;
use strand_core::storage::{ExecutionStore, RedbStore};
use strand_core::{EngineConfig, ExecutionEngine, WorkerConfig};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "strand.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::parse(&content)?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::parse("")?
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
}

impl AppState {
    /// `shutdown` reaches running handlers through their cancellation token
    pub fn new(config: &ServerConfig, shutdown: CancellationToken) -> Result<Self> {
        let store: Arc<dyn ExecutionStore> = Arc::new(
            RedbStore::new(config.index_path()).context("Failed to create execution store")?,
        );
        Ok(Self::with_store(store, config.engine.clone(), shutdown))
    }

    pub fn with_store(
        store: Arc<dyn ExecutionStore>,
        engine_config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::with_builtins());
        tracing::info!(node_types = ?registry.node_types(), "Registered activity handlers");

        let engine = ExecutionEngine::new(store, registry, engine_config).with_shutdown(shutdown);
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.storage.index_file, "strand.redb");
        assert_eq!(config.engine.default_timeout_secs, 30);
        assert_eq!(config.worker.concurrency, 1);
    }

    #[test]
    fn test_partial_sections() {
        let config = ServerConfig::parse(
            r#"
            [engine]
            lease_ttl_secs = 15

            [worker]
            concurrency = 4
            poll_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.lease_ttl_secs, 15);
        assert_eq!(config.engine.default_timeout_secs, 30);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.poll_interval_ms, 250);
        assert_eq!(config.worker.batch_size, 16);
    }

    #[test]
    fn test_load_missing_file_uses_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let config = ServerConfig::load(&dir.path().join("absent.toml"), data_dir.clone()).unwrap();

        assert!(data_dir.is_dir());
        assert_eq!(config.index_path(), data_dir.join("strand.redb"));
    }
}
