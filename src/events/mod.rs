//! Typed event families.
//!
//! Payloads are decoded once, at the subject dispatch boundary, into sum
//! types; handlers never look at raw JSON. Subjects follow
//! `<domain>.<entity>.<action>`.
//!
//! Decoding and validation are separate steps with separate errors: a
//! payload that does not parse is `Malformed`, one that parses but breaks
//! a field rule is `Invalid`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject names.
pub mod subjects {
    pub const ANIME_UPSERTED: &str = "catalog.anime.upserted";
    pub const JIKAN_SYNC: &str = "ingestion.jikan.sync";
    pub const HIANIME_SYNC: &str = "ingestion.hianime.sync";
    pub const ACTIVITY_PROGRESS: &str = "activity.progress";
    pub const COMMENTS_PREFIX: &str = "social.comments.";
    pub const COMMENTS_ALL: &str = "social.comments.*";
    pub const COMMENTS_CREATE: &str = "social.comments.create";
    pub const COMMENTS_UPDATE: &str = "social.comments.update";
    pub const COMMENTS_DELETE: &str = "social.comments.delete";
    pub const COMMENTS_VOTE: &str = "social.comments.vote";
}

/// Why a payload was rejected before reaching a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid event: {0}")]
    Invalid(String),
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, EventError> {
    serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))
}

fn require(field: &str, value: &str) -> Result<(), EventError> {
    if value.trim().is_empty() {
        Err(EventError::Invalid(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

fn unexpected(subject: &str) -> EventError {
    EventError::Invalid(format!("unexpected subject {}", subject))
}

// ============================================================================
// Catalog
// ============================================================================

/// Events emitted by the catalog outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    AnimeUpserted {
        event_id: Option<String>,
        anime_id: String,
    },
}

#[derive(Deserialize)]
struct AnimeUpsertedJson {
    event_id: Option<String>,
    #[serde(default)]
    anime_id: String,
}

impl CatalogEvent {
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, EventError> {
        match subject {
            subjects::ANIME_UPSERTED => {
                let json: AnimeUpsertedJson = parse(payload)?;
                Ok(Self::AnimeUpserted {
                    event_id: json.event_id.filter(|id| !id.is_empty()),
                    anime_id: json.anime_id.trim().to_string(),
                })
            }
            other => Err(unexpected(other)),
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        match self {
            Self::AnimeUpserted { anime_id, .. } => require("anime_id", anime_id),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::AnimeUpserted { event_id, .. } => event_id.as_deref(),
        }
    }
}

// ============================================================================
// Ingestion
// ============================================================================

/// Sync jobs requested of the ingestion workers.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestionJob {
    JikanSync {
        mal_id: i64,
        event_id: Option<String>,
    },
    HiAnimeSync {
        mal_id: i64,
        event_id: Option<String>,
    },
}

/// Wire form of a sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobJson {
    pub mal_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl IngestionJob {
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, EventError> {
        let make = match subject {
            subjects::JIKAN_SYNC => |mal_id, event_id| Self::JikanSync { mal_id, event_id },
            subjects::HIANIME_SYNC => |mal_id, event_id| Self::HiAnimeSync { mal_id, event_id },
            other => return Err(unexpected(other)),
        };
        let json: SyncJobJson = parse(payload)?;
        Ok(make(json.mal_id, json.event_id.filter(|id| !id.is_empty())))
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.mal_id() <= 0 {
            return Err(EventError::Invalid(format!(
                "mal_id must be positive, got {}",
                self.mal_id()
            )));
        }
        Ok(())
    }

    pub fn mal_id(&self) -> i64 {
        match self {
            Self::JikanSync { mal_id, .. } | Self::HiAnimeSync { mal_id, .. } => *mal_id,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::JikanSync { event_id, .. } | Self::HiAnimeSync { event_id, .. } => {
                event_id.as_deref()
            }
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            Self::JikanSync { .. } => subjects::JIKAN_SYNC,
            Self::HiAnimeSync { .. } => subjects::HIANIME_SYNC,
        }
    }
}

// ============================================================================
// Activity
// ============================================================================

/// A player reporting a playback position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_id: String,
    pub user_id: String,
    #[serde(default)]
    pub anime_id: String,
    pub episode_id: String,
    /// Seconds into the episode.
    pub position: i32,
    /// Client clock at the time of the report; later reports win.
    pub client_ts_ms: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, EventError> {
        match subject {
            subjects::ACTIVITY_PROGRESS => parse(payload),
            other => Err(unexpected(other)),
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        require("event_id", &self.event_id)?;
        require("user_id", &self.user_id)?;
        require("episode_id", &self.episode_id)?;
        if self.position < 0 {
            return Err(EventError::Invalid(format!(
                "position must not be negative, got {}",
                self.position
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Social
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateComment {
    pub event_id: String,
    pub user_id: String,
    pub anime_id: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub body: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateComment {
    pub event_id: String,
    pub user_id: String,
    pub comment_id: Uuid,
    pub body: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteComment {
    pub event_id: String,
    pub user_id: String,
    pub comment_id: Uuid,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteComment {
    pub event_id: String,
    pub user_id: String,
    pub comment_id: Uuid,
    /// -1, 0 (retract) or 1.
    pub vote: i16,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Comment mutations, one variant per `social.comments.<action>` subject.
#[derive(Debug, Clone, PartialEq)]
pub enum CommentEvent {
    Create(CreateComment),
    Update(UpdateComment),
    Delete(DeleteComment),
    Vote(VoteComment),
}

impl CommentEvent {
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, EventError> {
        let action = subject
            .strip_prefix(subjects::COMMENTS_PREFIX)
            .ok_or_else(|| unexpected(subject))?;
        match action {
            "create" => parse(payload).map(Self::Create),
            "update" => parse(payload).map(Self::Update),
            "delete" => parse(payload).map(Self::Delete),
            "vote" => parse(payload).map(Self::Vote),
            other => Err(EventError::Invalid(format!("unknown comment action {}", other))),
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        require("event_id", self.event_id())?;
        require("user_id", self.user_id())?;
        match self {
            Self::Create(create) => {
                require("anime_id", &create.anime_id)?;
                require("body", &create.body)
            }
            Self::Update(update) => require("body", &update.body),
            Self::Delete(_) => Ok(()),
            Self::Vote(vote) if (-1..=1).contains(&vote.vote) => Ok(()),
            Self::Vote(vote) => Err(EventError::Invalid(format!(
                "vote must be -1, 0 or 1, got {}",
                vote.vote
            ))),
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Self::Create(e) => &e.event_id,
            Self::Update(e) => &e.event_id,
            Self::Delete(e) => &e.event_id,
            Self::Vote(e) => &e.event_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Create(e) => &e.user_id,
            Self::Update(e) => &e.user_id,
            Self::Delete(e) => &e.user_id,
            Self::Vote(e) => &e.user_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Create(e) => e.created_at,
            Self::Update(e) => e.created_at,
            Self::Delete(e) => e.created_at,
            Self::Vote(e) => e.created_at,
        }
    }
}
