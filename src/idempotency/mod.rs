//! Idempotency store for deduplicating redelivered events.
//!
//! `check` is an atomic check-and-set on the event id: the first caller
//! for an id gets `false` (not yet processed) and records it; every later
//! caller gets `true`. A consumer whose effect fails after a successful
//! check calls `release`, so the redelivery is not mistaken for a
//! duplicate.
//!
//! Backends, in the order `create_store` prefers them:
//! 1. Redis: `SET key 1 NX EX ttl`
//! 2. PostgreSQL: insert into a processed-events ledger
//! 3. Memory: development only, refused when `production` is set
//!
//! # Configuration
//!
//! ```yaml
//! idempotency:
//!   redis_url: redis://localhost:6379
//!   database_url: postgres://localhost/ingestion
//!   ttl_secs: 86400
//!   key_prefix: ingestion
//!   table: processed_events
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
#[cfg(any(feature = "postgres", feature = "redis"))]
use tracing::info;
use tracing::warn;

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryIdempotencyStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyStore;
#[cfg(feature = "redis")]
pub use redis::RedisIdempotencyStore;

use crate::utils::bootstrap::redact_url;

/// Result type for idempotency operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Errors that can occur during idempotency operations.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Idempotency configuration error: {0}")]
    Config(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error("Idempotency store error: {0}")]
    Internal(String),
}

/// Atomic check-and-set on event ids.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Record `event_id`. Returns `true` if it was already recorded.
    async fn check(&self, event_id: &str) -> Result<bool>;

    /// Forget `event_id`, so its next delivery is processed again.
    async fn release(&self, event_id: &str) -> Result<()>;

    /// Backend name, for logs.
    fn backend(&self) -> &'static str;
}

// ============================================================================
// Configuration
// ============================================================================

/// Idempotency store selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Redis URL. Preferred when set.
    pub redis_url: Option<String>,
    /// PostgreSQL URL for a ledger-backed store.
    pub database_url: Option<String>,
    /// Marker lifetime in seconds (Redis and memory). Default: 24h.
    pub ttl_secs: u64,
    /// Refuse the in-memory fallback.
    pub production: bool,
    /// Redis key prefix: `<prefix>:idempotent:<event_id>`.
    pub key_prefix: String,
    /// Ledger table for the PostgreSQL backend.
    pub table: String,
    /// `subject` recorded on ledger rows written by the PostgreSQL backend.
    pub scope: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            ttl_secs: 24 * 60 * 60,
            production: false,
            key_prefix: "eventrelay".to_string(),
            table: "processed_events".to_string(),
            scope: "idempotency".to_string(),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn configured(url: &Option<String>) -> Option<&str> {
    url.as_deref().map(str::trim).filter(|u| !u.is_empty())
}

/// Build the first configured backend.
///
/// With nothing configured this returns a memory store, unless
/// `config.production` is set, in which case it is a configuration error.
pub async fn create_store(config: &IdempotencyConfig) -> Result<Arc<dyn IdempotencyStore>> {
    if let Some(url) = configured(&config.redis_url) {
        #[cfg(feature = "redis")]
        {
            let store = RedisIdempotencyStore::connect(url, &config.key_prefix, config.ttl()).await?;
            info!(backend = "redis", address = %redact_url(url), "Idempotency store ready");
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        {
            return Err(IdempotencyError::Config(format!(
                "redis_url {} is set but the 'redis' feature is not enabled",
                redact_url(url)
            )));
        }
    }

    if let Some(url) = configured(&config.database_url) {
        #[cfg(feature = "postgres")]
        {
            let store = PostgresIdempotencyStore::connect(url, &config.table, &config.scope).await?;
            info!(backend = "postgres", address = %redact_url(url), table = %config.table, "Idempotency store ready");
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "postgres"))]
        {
            return Err(IdempotencyError::Config(format!(
                "database_url {} is set but the 'postgres' feature is not enabled",
                redact_url(url)
            )));
        }
    }

    if config.production {
        return Err(IdempotencyError::Config(
            "no idempotency backend configured (set redis_url or database_url)".to_string(),
        ));
    }

    warn!("No idempotency backend configured, using in-memory store");
    Ok(Arc::new(MemoryIdempotencyStore::new(config.ttl())))
}
