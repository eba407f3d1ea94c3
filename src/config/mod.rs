//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{MessagingConfig, NatsConfig};
pub use storage::{PostgresConfig, StorageConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTRELAY_LOG";
/// Environment variable selecting the log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "EVENTRELAY_LOG_FORMAT";

use std::sync::Arc;

use serde::Deserialize;

use crate::bus::outbox::OutboxConfig;
use crate::consumer::ConsumersConfig;
use crate::idempotency::{self, IdempotencyConfig, IdempotencyStore};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Production deployment. Forbids in-memory fallbacks.
    pub production: bool,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Outbox publisher configuration.
    pub outbox: OutboxConfig,
    /// Idempotency store selection.
    pub idempotency: IdempotencyConfig,
    /// Durable consumers run by the worker.
    pub consumers: ConsumersConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
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

        let mut config: Config = config.try_deserialize()?;
        config.idempotency.production |= config.production;
        Ok(config)
    }

    /// Open the idempotency store when the deployment needs one.
    ///
    /// Production deployments always open it, so a missing durable
    /// backend fails at startup. Otherwise it is opened only when an
    /// enabled consumer deduplicates through it.
    pub async fn open_idempotency_store(&self) -> idempotency::Result<Option<Arc<dyn IdempotencyStore>>> {
        if !(self.idempotency.production || self.consumers.needs_store()) {
            return Ok(None);
        }
        idempotency::create_store(&self.idempotency).await.map(Some)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(!config.production);
        assert_eq!(config.messaging.nats.url, "nats://localhost:4222");
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.consumers.progress.consumer.subject, "activity.progress");
    }

    #[test]
    #[serial]
    fn test_config_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "production: true\nmessaging:\n  nats:\n    url: nats://bus:4222\noutbox:\n  batch_size: 25\nidempotency:\n  redis_url: redis://cache:6379\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert!(config.production);
        assert!(config.idempotency.production);
        assert_eq!(config.messaging.nats.url, "nats://bus:4222");
        assert_eq!(config.outbox.batch_size, 25);
        assert_eq!(config.outbox.table, "catalog_outbox");
        assert_eq!(
            config.idempotency.redis_url.as_deref(),
            Some("redis://cache:6379")
        );
    }

    #[tokio::test]
    async fn test_production_without_durable_store_fails_to_open() {
        let mut config = Config {
            production: true,
            ..Config::default()
        };
        config.idempotency.production = true;

        let result = config.open_idempotency_store().await;

        assert!(matches!(result, Err(idempotency::IdempotencyError::Config(_))));
    }

    #[tokio::test]
    async fn test_store_opened_only_when_needed() {
        let mut config = Config::default();
        assert!(config.open_idempotency_store().await.unwrap().is_none());

        config.consumers.comments.dedup = crate::consumer::DedupMode::Store;
        let store = config.open_idempotency_store().await.unwrap().unwrap();
        assert_eq!(store.backend(), "memory");

        config.consumers.comments.enabled = false;
        assert!(config.open_idempotency_store().await.unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_config_env_override() {
        std::env::set_var("EVENTRELAY__OUTBOX__POLL_INTERVAL_MS", "250");
        let config = Config::load(None);
        std::env::remove_var("EVENTRELAY__OUTBOX__POLL_INTERVAL_MS");

        assert_eq!(config.unwrap().outbox.poll_interval_ms, 250);
    }
}
