//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod limits;
mod messaging;
mod storage;

pub use limits::{RecordLimits, DEFAULT_MAX_ID_LEN, DEFAULT_MAX_VALUE_BYTES};
pub use messaging::{KafkaConfig, MessagingConfig, MessagingType, DEFAULT_TOPIC};
pub use storage::{StorageConfig, MEMORY_PATH};

/// Error produced while loading configuration.
pub use ::config::ConfigError;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CARGA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CARGA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CARGA_LOG";
/// Environment variable selecting log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "CARGA_LOG_FORMAT";

use serde::Deserialize;

use crate::coordinator::CoordinatorConfig;
use crate::idempotency::IdempotencyConfig;
use crate::relay::RelayConfig;
use crate::sync::SyncConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration (records + outbox).
    pub storage: StorageConfig,
    /// Event log configuration.
    pub messaging: MessagingConfig,
    /// Write coordinator configuration.
    pub coordinator: CoordinatorConfig,
    /// Relay worker configuration.
    pub relay: RelayConfig,
    /// Consumer-side deduplication window.
    pub idempotency: IdempotencyConfig,
    /// Sync consumer configuration.
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave the relay unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Message(msg)) };

        if self.coordinator.partitions == 0 {
            return invalid("coordinator.partitions must be at least 1".into());
        }
        if self.relay.batch_size == 0 {
            return invalid("relay.batch_size must be at least 1".into());
        }
        if self.relay.lease_duration_ms == 0 {
            return invalid("relay.lease_duration_ms must be at least 1".into());
        }
        if self.relay.workers == 0 {
            return invalid("relay.workers must be at least 1".into());
        }
        if self.relay.shard_index >= self.relay.shard_count {
            return invalid(format!(
                "relay.shard_index {} out of range for shard_count {}",
                self.relay.shard_index, self.relay.shard_count
            ));
        }
        Ok(())
    }

    /// Create config for testing: in-memory storage, channel log.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig::memory(),
            ..Default::default()
        }
    }
}
