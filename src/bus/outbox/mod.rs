//! Transactional outbox for guaranteed event delivery.
//!
//! Events are written to an outbox table inside the same transaction as
//! the business change that caused them, then a publisher relays them to
//! the durable log. The flow:
//!
//! 1. Business write and outbox insert commit together
//! 2. The publisher claims a batch of unpublished rows (`FOR UPDATE SKIP LOCKED`)
//! 3. Each row's payload is published to the subject named by its `event_type`
//! 4. The batch is marked published and the claim commits
//!
//! If any publish in step 3 fails, the claim rolls back and the whole
//! batch is retried on the next tick. Rows emitted before the failure are
//! emitted again, so delivery is at-least-once and consumers deduplicate
//! on the envelope's `event_id`.
//!
//! Several publisher replicas may poll the same table: skip-locked claims
//! never hand the same row to two of them at once.
//!
//! # Configuration
//!
//! ```yaml
//! outbox:
//!   table: catalog_outbox
//!   batch_size: 100
//!   poll_interval_ms: 2000
//!   retention_hours: 168
//!   stream:
//!     name: CATALOG_EVENTS
//!     subjects: ["catalog.>"]
//!     max_age_secs: 604800
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BusError, EventLog, StreamSpec};

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryOutboxStore;
#[cfg(feature = "postgres")]
pub use postgres::{enqueue, PostgresOutboxStore};

// ============================================================================
// Types
// ============================================================================

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors that can occur while writing or relaying the outbox.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// One row of the outbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: Uuid,
    /// Destination subject, e.g. `catalog.anime.upserted`.
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the row has been emitted.
    pub published_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Outbox configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Outbox table name. Default: catalog_outbox.
    pub table: String,
    /// Maximum rows claimed per flush. Default: 100.
    pub batch_size: usize,
    /// Poll interval in milliseconds. Default: 2000.
    pub poll_interval_ms: u64,
    /// Destination stream, reconciled before the first poll.
    pub stream: StreamSpec,
    /// Delete published rows older than this. `None` keeps them forever.
    pub retention_hours: Option<u64>,
    /// Interval between prune passes in seconds. Default: 3600.
    pub prune_interval_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            table: "catalog_outbox".to_string(),
            batch_size: 100,
            poll_interval_ms: 2000,
            stream: StreamSpec::default(),
            retention_hours: Some(7 * 24),
            prune_interval_secs: 3600,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_hours
            .map(|hours| Duration::from_secs(hours * 60 * 60))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

// ============================================================================
// Store seam
// ============================================================================

/// Storage side of the outbox.
///
/// Implementations:
/// - `PostgresOutboxStore`: row locks held by an open transaction
/// - `MemoryOutboxStore`: in-flight id set, for tests and local runs
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `batch_size` unpublished rows, oldest first.
    ///
    /// Claimed rows are invisible to concurrent claims until the returned
    /// claim is settled or dropped.
    async fn claim(&self, batch_size: usize) -> Result<Box<dyn OutboxClaim>>;

    /// Delete rows published longer than `older_than` ago. Unpublished
    /// rows are never deleted. Returns the number of rows removed.
    async fn prune_published(&self, older_than: Duration) -> Result<u64>;
}

/// An exclusive hold on a batch of unpublished rows.
///
/// Dropping a claim without settling it releases the rows.
#[async_trait]
pub trait OutboxClaim: Send {
    fn events(&self) -> &[OutboxEvent];

    /// Mark every claimed row published and release the hold.
    async fn mark_published(self: Box<Self>) -> Result<()>;

    /// Release the hold without changing any row.
    async fn release(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// Publisher
// ============================================================================

/// Relays outbox rows to the event log.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    log: Arc<dyn EventLog>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, log: Arc<dyn EventLog>, config: OutboxConfig) -> Self {
        Self { store, log, config }
    }

    /// Create or reconcile the destination stream.
    pub async fn ensure_stream(&self) -> Result<()> {
        self.log.ensure_stream(&self.config.stream).await?;
        Ok(())
    }

    /// Claim one batch, emit it in `created_at` order and mark it published.
    ///
    /// All or nothing: on the first failed emit the claim is released, no
    /// row of the batch is marked, and the error is returned.
    pub async fn flush_once(&self) -> Result<usize> {
        let claim = self.store.claim(self.config.batch_size).await?;
        if claim.events().is_empty() {
            claim.release().await?;
            return Ok(0);
        }

        let events = claim.events().to_vec();
        match self.emit(&events).await {
            Ok(count) => {
                claim.mark_published().await?;
                debug!(count, "Outbox batch published");
                Ok(count)
            }
            Err(e) => {
                if let Err(release_err) = claim.release().await {
                    warn!(error = %release_err, "Failed to release outbox claim");
                }
                Err(e)
            }
        }
    }

    async fn emit(&self, events: &[OutboxEvent]) -> Result<usize> {
        for event in events {
            let payload = serde_json::to_vec(&event.payload)?;
            self.log
                .publish(&event.event_type, Bytes::from(payload))
                .await
                .inspect_err(|e| {
                    warn!(id = %event.id, subject = %event.event_type, error = %e, "Outbox publish failed");
                })?;
        }
        Ok(events.len())
    }

    /// Ensure the stream, then flush on every poll tick until shutdown.
    ///
    /// Stream setup failure is returned immediately. Flush failures are
    /// logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.ensure_stream().await?;
        info!(
            table = %self.config.table,
            stream = %self.config.stream.name,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Outbox publisher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_prune: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.flush_once().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Published outbox events"),
                Err(e) => warn!(error = %e, "Outbox flush failed, retrying next tick"),
            }
            self.prune_if_due(&mut last_prune).await;
        }

        info!("Outbox publisher stopped");
        Ok(())
    }

    async fn prune_if_due(&self, last_prune: &mut Option<Instant>) {
        let Some(retention) = self.config.retention() else {
            return;
        };
        if last_prune.is_some_and(|at| at.elapsed() < self.config.prune_interval()) {
            return;
        }
        *last_prune = Some(Instant::now());

        match self.store.prune_published(retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned published outbox rows"),
            Err(e) => warn!(error = %e, "Outbox prune failed"),
        }
    }
}
