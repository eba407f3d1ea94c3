//! Processed-events ledger.
//!
//! One row per event a consumer group has applied. Inserting the row is
//! the atomic claim on the event: the primary key on `event_id` lets
//! exactly one insert win, and a conflicting insert affects zero rows.

use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, OnConflict, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::{PgExecutor, PgPool};

use super::schema::ProcessedEvents;
use super::StorageError;

/// Ledger row recording one applied event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    /// Raw message bytes, kept for audit.
    pub payload: Option<Vec<u8>>,
}

impl ProcessedEvent {
    pub fn new(event_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            subject: subject.into(),
            created_at: Utc::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = Some(payload.to_vec());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Insert `record` into the ledger `table`.
///
/// Returns `true` if this call inserted the row and `false` if the event
/// was already recorded. Pass `&mut *tx` to claim the event inside the
/// same transaction as its effect.
pub async fn mark_processed<'c, E>(
    executor: E,
    table: &str,
    record: &ProcessedEvent,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'c>,
{
    let (sql, values) = Query::insert()
        .into_table(Alias::new(table))
        .columns([
            ProcessedEvents::EventId,
            ProcessedEvents::Subject,
            ProcessedEvents::CreatedAt,
            ProcessedEvents::Payload,
        ])
        .values_panic([
            record.event_id.clone().into(),
            record.subject.clone().into(),
            record.created_at.into(),
            record.payload.clone().into(),
        ])
        .on_conflict(
            OnConflict::column(ProcessedEvents::EventId)
                .do_nothing()
                .to_owned(),
        )
        .build_sqlx(PostgresQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(executor).await?;
    Ok(result.rows_affected() == 1)
}

/// Remove the ledger row for `event_id`. Returns whether a row was removed.
pub async fn unmark_processed<'c, E>(
    executor: E,
    table: &str,
    event_id: &str,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'c>,
{
    let (sql, values) = Query::delete()
        .from_table(Alias::new(table))
        .and_where(Expr::col(ProcessedEvents::EventId).eq(event_id))
        .build_sqlx(PostgresQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

/// Fail if the ledger `table` does not exist. Run at consumer startup.
pub async fn verify_table(pool: &PgPool, table: &str) -> Result<(), StorageError> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(table)
        .fetch_one(pool)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(StorageError::MissingTable(table.to_string()))
    }
}
