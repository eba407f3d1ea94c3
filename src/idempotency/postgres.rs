//! PostgreSQL idempotency store backed by a processed-events ledger.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{IdempotencyStore, Result};
use crate::storage::{mark_processed, unmark_processed, verify_table, ProcessedEvent};

/// Ledger-backed store. Markers never expire.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    table: String,
    scope: String,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool, table: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            scope: scope.into(),
        }
    }

    /// Open a lazy pool on `url` and verify the ledger table exists.
    pub async fn connect(url: &str, table: &str, scope: &str) -> Result<Self> {
        let pool = PgPool::connect_lazy(url)?;
        verify_table(&pool, table).await?;
        Ok(Self::new(pool, table, scope))
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn check(&self, event_id: &str) -> Result<bool> {
        let record = ProcessedEvent::new(event_id, self.scope.as_str());
        let inserted = mark_processed(&self.pool, &self.table, &record).await?;
        Ok(!inserted)
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        unmark_processed(&self.pool, &self.table, event_id).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
