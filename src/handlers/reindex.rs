//! Search reindexing on catalog upserts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::EffectError;
use crate::consumer::{Applied, EventHandler, HandleError, MessageContext};
use crate::events::CatalogEvent;

/// Search index the catalog is mirrored into.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    /// Re-read `anime_id` from the catalog and write it to the index.
    async fn reindex_anime(&self, anime_id: &str) -> Result<(), EffectError>;
}

/// Consumes `catalog.anime.upserted`. Run with `Dedup::Store`.
pub struct ReindexHandler {
    indexer: Arc<dyn SearchIndexer>,
}

impl ReindexHandler {
    pub fn new(indexer: Arc<dyn SearchIndexer>) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl EventHandler for ReindexHandler {
    type Event = CatalogEvent;

    fn decode(&self, subject: &str, payload: &[u8]) -> Result<CatalogEvent, HandleError> {
        Ok(CatalogEvent::decode(subject, payload)?)
    }

    fn validate(&self, event: &CatalogEvent) -> Result<(), HandleError> {
        Ok(event.validate()?)
    }

    fn event_id<'e>(&self, event: &'e CatalogEvent) -> Option<&'e str> {
        event.event_id()
    }

    async fn apply(&self, event: &CatalogEvent, _ctx: &MessageContext<'_>) -> Result<Applied, HandleError> {
        match event {
            CatalogEvent::AnimeUpserted { anime_id, .. } => {
                self.indexer
                    .reindex_anime(anime_id)
                    .await
                    .map_err(|e| HandleError::Transient(format!("reindex {}: {}", anime_id, e)))?;
                debug!(%anime_id, "Anime reindexed");
            }
        }
        Ok(Applied::Done)
    }
}
