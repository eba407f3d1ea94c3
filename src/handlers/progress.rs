//! Watch-progress consumer.
//!
//! The ledger insert and the progress upsert share one transaction, so an
//! event is either fully applied and recorded or neither. Reports arriving
//! out of order never move progress backwards: the upsert only overwrites
//! a row whose `client_ts_ms` is not newer than the incoming one.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Alias, Expr, OnConflict, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::consumer::{Applied, EventHandler, HandleError, MessageContext};
use crate::events::ProgressEvent;
use crate::storage::schema::UserEpisodeProgress;
use crate::storage::{mark_processed, ProcessedEvent};

/// Consumes `activity.progress`. Run with `Dedup::Transactional`.
pub struct ProgressHandler {
    pool: PgPool,
    processed_table: String,
}

impl ProgressHandler {
    pub fn new(pool: PgPool, processed_table: impl Into<String>) -> Self {
        Self {
            pool,
            processed_table: processed_table.into(),
        }
    }
}

/// Upsert the user's position in the episode, ignoring stale reports.
pub async fn upsert_progress(conn: &mut PgConnection, event: &ProgressEvent) -> Result<u64, sqlx::Error> {
    let (sql, values) = Query::insert()
        .into_table(UserEpisodeProgress::Table)
        .columns([
            UserEpisodeProgress::UserId,
            UserEpisodeProgress::EpisodeId,
            UserEpisodeProgress::PositionSeconds,
            UserEpisodeProgress::DurationSeconds,
            UserEpisodeProgress::Completed,
            UserEpisodeProgress::ClientTsMs,
            UserEpisodeProgress::UpdatedAt,
        ])
        .values_panic([
            event.user_id.clone().into(),
            event.episode_id.clone().into(),
            event.position.into(),
            0i32.into(),
            false.into(),
            event.client_ts_ms.into(),
            Utc::now().into(),
        ])
        .on_conflict(
            OnConflict::columns([UserEpisodeProgress::UserId, UserEpisodeProgress::EpisodeId])
                .update_columns([
                    UserEpisodeProgress::PositionSeconds,
                    UserEpisodeProgress::DurationSeconds,
                    UserEpisodeProgress::Completed,
                    UserEpisodeProgress::ClientTsMs,
                    UserEpisodeProgress::UpdatedAt,
                ])
                .action_and_where(
                    Expr::col((UserEpisodeProgress::Table, UserEpisodeProgress::ClientTsMs))
                        .lte(Expr::col((Alias::new("excluded"), UserEpisodeProgress::ClientTsMs))),
                )
                .to_owned(),
        )
        .build_sqlx(PostgresQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl EventHandler for ProgressHandler {
    type Event = ProgressEvent;

    fn decode(&self, subject: &str, payload: &[u8]) -> Result<ProgressEvent, HandleError> {
        Ok(ProgressEvent::decode(subject, payload)?)
    }

    fn validate(&self, event: &ProgressEvent) -> Result<(), HandleError> {
        Ok(event.validate()?)
    }

    fn event_id<'e>(&self, event: &'e ProgressEvent) -> Option<&'e str> {
        Some(&event.event_id)
    }

    async fn apply(&self, event: &ProgressEvent, ctx: &MessageContext<'_>) -> Result<Applied, HandleError> {
        let mut tx = self.pool.begin().await?;

        let record = ProcessedEvent::new(event.event_id.as_str(), ctx.subject)
            .with_payload(ctx.payload)
            .with_created_at(event.created_at);
        if !mark_processed(&mut *tx, &self.processed_table, &record).await? {
            tx.rollback().await?;
            return Ok(Applied::Duplicate);
        }

        let updated = upsert_progress(&mut *tx, event).await?;
        tx.commit().await?;

        debug!(
            event_id = %event.event_id,
            user_id = %event.user_id,
            episode_id = %event.episode_id,
            stale = updated == 0,
            "Progress applied"
        );
        Ok(Applied::Done)
    }
}
