//! Comment mutation consumer.
//!
//! Each event is recorded in the ledger and applied in one transaction.
//! Update and delete only touch live comments owned by the event's user.
//! A vote replaces the user's previous vote and moves the comment score
//! by the difference.

use async_trait::async_trait;
use sea_query::{Expr, LockType, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::PgConnection;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::consumer::{Applied, EventHandler, HandleError, MessageContext};
use crate::events::{CommentEvent, CreateComment, DeleteComment, UpdateComment, VoteComment};
use crate::storage::schema::{CommentVotes, Comments};
use crate::storage::{mark_processed, ProcessedEvent};

/// Body written over soft-deleted comments.
pub const DELETED_BODY: &str = "[deleted]";

/// Consumes `social.comments.*`. Run with `Dedup::Transactional`.
pub struct CommentsHandler {
    pool: PgPool,
    processed_table: String,
}

impl CommentsHandler {
    pub fn new(pool: PgPool, processed_table: impl Into<String>) -> Self {
        Self {
            pool,
            processed_table: processed_table.into(),
        }
    }
}

fn classify(e: sqlx::Error) -> HandleError {
    match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            HandleError::Invalid(format!("references a missing comment: {}", db))
        }
        _ => HandleError::Transient(e.to_string()),
    }
}

async fn create_comment(conn: &mut PgConnection, event: &CreateComment) -> Result<u64, sqlx::Error> {
    let (sql, values) = Query::insert()
        .into_table(Comments::Table)
        .columns([Comments::AnimeId, Comments::UserId, Comments::ParentId, Comments::Body])
        .values_panic([
            event.anime_id.clone().into(),
            event.user_id.clone().into(),
            event.parent_id.into(),
            event.body.clone().into(),
        ])
        .build_sqlx(PostgresQueryBuilder);

    Ok(sqlx::query_with(&sql, values).execute(conn).await?.rows_affected())
}

async fn update_comment(conn: &mut PgConnection, event: &UpdateComment) -> Result<u64, sqlx::Error> {
    let (sql, values) = Query::update()
        .table(Comments::Table)
        .values([
            (Comments::Body, event.body.clone().into()),
            (Comments::UpdatedAt, Expr::current_timestamp().into()),
        ])
        .and_where(Expr::col(Comments::Id).eq(event.comment_id))
        .and_where(Expr::col(Comments::UserId).eq(event.user_id.as_str()))
        .and_where(Expr::col(Comments::DeletedAt).is_null())
        .build_sqlx(PostgresQueryBuilder);

    Ok(sqlx::query_with(&sql, values).execute(conn).await?.rows_affected())
}

async fn delete_comment(conn: &mut PgConnection, event: &DeleteComment) -> Result<u64, sqlx::Error> {
    let (sql, values) = Query::update()
        .table(Comments::Table)
        .values([
            (Comments::Body, DELETED_BODY.into()),
            (Comments::DeletedAt, Expr::current_timestamp().into()),
        ])
        .and_where(Expr::col(Comments::Id).eq(event.comment_id))
        .and_where(Expr::col(Comments::UserId).eq(event.user_id.as_str()))
        .and_where(Expr::col(Comments::DeletedAt).is_null())
        .build_sqlx(PostgresQueryBuilder);

    Ok(sqlx::query_with(&sql, values).execute(conn).await?.rows_affected())
}

/// Returns the score delta applied, or `None` when the comment does not exist.
async fn vote_comment(conn: &mut PgConnection, event: &VoteComment) -> Result<Option<i32>, sqlx::Error> {
    // Lock the comment so concurrent votes on it serialize
    let (sql, values) = Query::select()
        .column(Comments::Id)
        .from(Comments::Table)
        .and_where(Expr::col(Comments::Id).eq(event.comment_id))
        .lock(LockType::Update)
        .build_sqlx(PostgresQueryBuilder);
    let comment: Option<Uuid> = sqlx::query_scalar_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;
    if comment.is_none() {
        return Ok(None);
    }

    let (sql, values) = Query::select()
        .column(CommentVotes::Vote)
        .from(CommentVotes::Table)
        .and_where(Expr::col(CommentVotes::CommentId).eq(event.comment_id))
        .and_where(Expr::col(CommentVotes::UserId).eq(event.user_id.as_str()))
        .build_sqlx(PostgresQueryBuilder);
    let previous: Option<i16> = sqlx::query_scalar_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;

    let (sql, values) = match previous {
        None => Query::insert()
            .into_table(CommentVotes::Table)
            .columns([CommentVotes::CommentId, CommentVotes::UserId, CommentVotes::Vote])
            .values_panic([
                event.comment_id.into(),
                event.user_id.clone().into(),
                event.vote.into(),
            ])
            .build_sqlx(PostgresQueryBuilder),
        Some(_) => Query::update()
            .table(CommentVotes::Table)
            .values([(CommentVotes::Vote, event.vote.into())])
            .and_where(Expr::col(CommentVotes::CommentId).eq(event.comment_id))
            .and_where(Expr::col(CommentVotes::UserId).eq(event.user_id.as_str()))
            .build_sqlx(PostgresQueryBuilder),
    };
    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    let delta = i32::from(event.vote) - i32::from(previous.unwrap_or(0));
    if delta != 0 {
        let (sql, values) = Query::update()
            .table(Comments::Table)
            .values([(Comments::Score, Expr::col(Comments::Score).add(delta))])
            .and_where(Expr::col(Comments::Id).eq(event.comment_id))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    }
    Ok(Some(delta))
}

#[async_trait]
impl EventHandler for CommentsHandler {
    type Event = CommentEvent;

    fn decode(&self, subject: &str, payload: &[u8]) -> Result<CommentEvent, HandleError> {
        Ok(CommentEvent::decode(subject, payload)?)
    }

    fn validate(&self, event: &CommentEvent) -> Result<(), HandleError> {
        Ok(event.validate()?)
    }

    fn event_id<'e>(&self, event: &'e CommentEvent) -> Option<&'e str> {
        Some(event.event_id())
    }

    async fn apply(&self, event: &CommentEvent, ctx: &MessageContext<'_>) -> Result<Applied, HandleError> {
        let mut tx = self.pool.begin().await?;

        let record = ProcessedEvent::new(event.event_id(), ctx.subject)
            .with_payload(ctx.payload)
            .with_created_at(event.created_at());
        if !mark_processed(&mut *tx, &self.processed_table, &record).await? {
            tx.rollback().await?;
            return Ok(Applied::Duplicate);
        }

        match event {
            CommentEvent::Create(create) => {
                create_comment(&mut *tx, create).await.map_err(classify)?;
                debug!(event_id = %create.event_id, anime_id = %create.anime_id, "Comment created");
            }
            CommentEvent::Update(update) => {
                let rows = update_comment(&mut *tx, update).await.map_err(classify)?;
                debug!(event_id = %update.event_id, comment_id = %update.comment_id, rows, "Comment updated");
            }
            CommentEvent::Delete(delete) => {
                let rows = delete_comment(&mut *tx, delete).await.map_err(classify)?;
                debug!(event_id = %delete.event_id, comment_id = %delete.comment_id, rows, "Comment deleted");
            }
            CommentEvent::Vote(vote) => match vote_comment(&mut *tx, vote).await.map_err(classify)? {
                Some(delta) => {
                    debug!(event_id = %vote.event_id, comment_id = %vote.comment_id, delta, "Vote applied")
                }
                None => {
                    info!(event_id = %vote.event_id, comment_id = %vote.comment_id, "Vote on missing comment skipped")
                }
            },
        }

        tx.commit().await?;
        Ok(Applied::Done)
    }
}
