use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Service configuration, read once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub entities: EntitiesConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Chunking, dispatch and retry settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum pages per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunk invocations allowed in flight at once, across all runs
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,

    /// Pool size for the text extraction stage
    #[serde(default = "default_text_workers")]
    pub text_workers: usize,

    /// Pool size for the entity extraction stage
    #[serde(default = "default_entity_workers")]
    pub entity_workers: usize,

    /// Working time allowed for one chunk attempt in seconds; waiting for a
    /// stage pool permit does not count
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,

    /// Attempts per chunk, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts for the final record store write
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,

    /// How often the worker looks for pending documents
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            text_workers: default_text_workers(),
            entity_workers: default_entity_workers(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            persist_attempts: default_persist_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> ServiceResult<()> {
        let checks = [
            (self.chunk_size, "pipeline.chunk_size"),
            (self.max_concurrent_chunks, "pipeline.max_concurrent_chunks"),
            (self.text_workers, "pipeline.text_workers"),
            (self.entity_workers, "pipeline.entity_workers"),
            (self.max_attempts as usize, "pipeline.max_attempts"),
            (self.persist_attempts as usize, "pipeline.persist_attempts"),
        ];
        for (value, key) in checks {
            if value == 0 {
                return Err(ServiceError::Config {
                    message: format!("{} must be at least 1", key),
                });
            }
        }
        Ok(())
    }
}

/// Which entity extractor the second stage uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityBackend {
    #[default]
    Heuristic,
    Ollama,
}

/// Entity extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EntitiesConfig {
    #[serde(default)]
    pub backend: EntityBackend,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EntitiesConfig {
    fn default() -> Self {
        Self {
            backend: EntityBackend::default(),
            ollama_url: default_ollama_url(),
            model: default_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            storage: default_storage(),
            pipeline: PipelineConfig::default(),
            entities: EntitiesConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional `config` file and `FOLIO__*` env vars
    pub fn load() -> ServiceResult<Self> {
        let config: AppConfig = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("FOLIO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })?;

        config.pipeline.validate()?;
        Ok(config)
    }
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_chunk_size() -> usize {
    2
}

fn default_max_concurrent_chunks() -> usize {
    8
}

fn default_text_workers() -> usize {
    4
}

fn default_entity_workers() -> usize {
    4
}

fn default_chunk_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.chunk_size, 2);
        assert_eq!(pipeline.max_attempts, 3);
        assert_eq!(pipeline.chunk_timeout(), Duration::from_secs(120));
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let pipeline = PipelineConfig {
            chunk_size: 0,
            ..PipelineConfig::default()
        };
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("pipeline.chunk_size"));
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let config: AppConfig = Config::builder()
            .set_override("pipeline.chunk_size", 5)
            .unwrap()
            .set_override("entities.backend", "ollama")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.chunk_size, 5);
        assert_eq!(config.pipeline.text_workers, 4);
        assert_eq!(config.entities.backend, EntityBackend::Ollama);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.data_dir, PathBuf::from("./data"));
    }
}
