//! Database schema definitions using sea-query.
//!
//! These define the column identifiers for type-safe query building, and
//! the DDL for the tables the consumers write to. Table names of the
//! dedup ledgers are configurable per consumer group, so only their
//! columns are modelled here.

use sea_query::Iden;

/// Processed-events ledger columns.
#[derive(Iden)]
pub enum ProcessedEvents {
    #[iden = "event_id"]
    EventId,
    #[iden = "subject"]
    Subject,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "payload"]
    Payload,
}

/// Watch-progress table columns.
#[derive(Iden)]
pub enum UserEpisodeProgress {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "episode_id"]
    EpisodeId,
    #[iden = "position_seconds"]
    PositionSeconds,
    #[iden = "duration_seconds"]
    DurationSeconds,
    #[iden = "completed"]
    Completed,
    #[iden = "client_ts_ms"]
    ClientTsMs,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Comments table columns.
#[derive(Iden)]
pub enum Comments {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "anime_id"]
    AnimeId,
    #[iden = "user_id"]
    UserId,
    #[iden = "parent_id"]
    ParentId,
    #[iden = "body"]
    Body,
    #[iden = "score"]
    Score,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "deleted_at"]
    DeletedAt,
}

/// Comment votes table columns.
#[derive(Iden)]
pub enum CommentVotes {
    Table,
    #[iden = "comment_id"]
    CommentId,
    #[iden = "user_id"]
    UserId,
    #[iden = "vote"]
    Vote,
}

/// SQL for creating a processed-events ledger named `processed_events`.
pub const CREATE_PROCESSED_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processed_events (
    event_id TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    payload BYTEA NULL
);
"#;

/// SQL for creating the watch-progress table of the activity service.
pub const CREATE_USER_EPISODE_PROGRESS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_episode_progress (
    user_id TEXT NOT NULL,
    episode_id TEXT NOT NULL,
    position_seconds INTEGER NOT NULL,
    duration_seconds INTEGER NOT NULL DEFAULT 0,
    completed BOOLEAN NOT NULL DEFAULT FALSE,
    client_ts_ms BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, episode_id)
);
"#;

/// SQL for creating the comment tables of the social service.
pub const CREATE_COMMENTS_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS comments (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    anime_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    parent_id UUID NULL REFERENCES comments(id),
    body TEXT NOT NULL,
    score INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    deleted_at TIMESTAMPTZ NULL
);

CREATE INDEX IF NOT EXISTS idx_comments_anime ON comments(anime_id, created_at);

CREATE TABLE IF NOT EXISTS comment_votes (
    comment_id UUID NOT NULL REFERENCES comments(id),
    user_id TEXT NOT NULL,
    vote SMALLINT NOT NULL,
    PRIMARY KEY (comment_id, user_id)
);
"#;
