//! PostgreSQL outbox store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{
    Alias, ColumnDef, Expr, Iden, LockBehavior, LockType, Order, PostgresQueryBuilder, Query,
    Table,
};
use sea_query_binder::SqlxBinder;
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{OutboxClaim, OutboxError, OutboxEvent, OutboxStore, Result};
use crate::envelope::EventEnvelope;

// ============================================================================
// Schema
// ============================================================================

/// Outbox table columns. The table name itself is configurable.
#[derive(Iden)]
enum OutboxColumn {
    #[iden = "id"]
    Id,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "published_at"]
    PublishedAt,
}

// ============================================================================
// Writer
// ============================================================================

/// Insert an enveloped event into the outbox table `table`.
///
/// Call with the caller's open transaction (`&mut *tx`) so the row
/// commits or rolls back with the business change. The row id is also
/// the envelope's `event_id`.
pub async fn enqueue<T: Serialize + Sync>(
    conn: &mut PgConnection,
    table: &str,
    event_type: &str,
    body: &T,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let payload = serde_json::to_value(EventEnvelope::with_id(id.to_string(), body))?;

    let (sql, values) = Query::insert()
        .into_table(Alias::new(table))
        .columns([
            OutboxColumn::Id,
            OutboxColumn::EventType,
            OutboxColumn::Payload,
        ])
        .values_panic([id.into(), event_type.into(), payload.into()])
        .build_sqlx(PostgresQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    debug!(id = %id, event_type = %event_type, "Event written to outbox");
    Ok(id)
}

// ============================================================================
// Store
// ============================================================================

/// Outbox store on PostgreSQL.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    table: String,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert an enveloped event inside `tx`.
    pub async fn enqueue_in<T: Serialize + Sync>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_type: &str,
        body: &T,
    ) -> Result<Uuid> {
        enqueue(&mut **tx, &self.table, event_type, body).await
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Alias::new(&self.table))
            .if_not_exists()
            .col(ColumnDef::new(OutboxColumn::Id).uuid().primary_key())
            .col(ColumnDef::new(OutboxColumn::EventType).text().not_null())
            .col(ColumnDef::new(OutboxColumn::Payload).json_binary().not_null())
            .col(
                ColumnDef::new(OutboxColumn::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .col(ColumnDef::new(OutboxColumn::PublishedAt).timestamp_with_time_zone())
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        // Claims only ever scan unpublished rows
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{table}_unpublished\" ON \"{table}\" (created_at) WHERE published_at IS NULL",
            table = self.table
        );
        sqlx::query(&create_index).execute(&self.pool).await?;

        info!(table = %self.table, "Outbox table initialized (PostgreSQL)");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim(&self, batch_size: usize) -> Result<Box<dyn OutboxClaim>> {
        let mut tx = self.pool.begin().await?;

        let (sql, values) = Query::select()
            .columns([
                OutboxColumn::Id,
                OutboxColumn::EventType,
                OutboxColumn::Payload,
                OutboxColumn::CreatedAt,
            ])
            .from(Alias::new(&self.table))
            .and_where(Expr::col(OutboxColumn::PublishedAt).is_null())
            .order_by(OutboxColumn::CreatedAt, Order::Asc)
            .limit(batch_size as u64)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .build_sqlx(PostgresQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *tx).await?;
        let events = rows
            .iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                    published_at: None,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        Ok(Box::new(PostgresClaim {
            tx,
            table: self.table.clone(),
            events,
        }))
    }

    async fn prune_published(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| OutboxError::Store(e.to_string()))?;

        let (sql, values) = Query::delete()
            .from_table(Alias::new(&self.table))
            .and_where(Expr::col(OutboxColumn::PublishedAt).is_not_null())
            .and_where(Expr::col(OutboxColumn::PublishedAt).lt(cutoff))
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Claim backed by an open transaction holding the row locks.
struct PostgresClaim {
    tx: Transaction<'static, Postgres>,
    table: String,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxClaim for PostgresClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_published(mut self: Box<Self>) -> Result<()> {
        let ids: Vec<Uuid> = self.events.iter().map(|e| e.id).collect();
        if !ids.is_empty() {
            let (sql, values) = Query::update()
                .table(Alias::new(&self.table))
                .value(OutboxColumn::PublishedAt, Expr::current_timestamp())
                .and_where(Expr::col(OutboxColumn::Id).is_in(ids))
                .and_where(Expr::col(OutboxColumn::PublishedAt).is_null())
                .build_sqlx(PostgresQueryBuilder);
            sqlx::query_with(&sql, values)
                .execute(&mut *self.tx)
                .await?;
        }
        self.tx.commit().await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
