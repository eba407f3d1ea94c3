//! Sync job producer.

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::bus::{BusError, EventLog};
use crate::events::{IngestionJob, SyncJobJson};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publishes sync jobs for the ingestion consumers.
pub struct JobProducer {
    log: Arc<dyn EventLog>,
}

impl JobProducer {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Publish `{"mal_id": N}` to `ingestion.jikan.sync`.
    pub async fn request_jikan_sync(&self, mal_id: i64) -> Result<(), JobError> {
        self.request(&IngestionJob::JikanSync { mal_id, event_id: None }).await
    }

    pub async fn request_hianime_sync(&self, mal_id: i64) -> Result<(), JobError> {
        self.request(&IngestionJob::HiAnimeSync { mal_id, event_id: None })
            .await
    }

    pub async fn request(&self, job: &IngestionJob) -> Result<(), JobError> {
        job.validate().map_err(|e| JobError::Invalid(e.to_string()))?;
        let body = serde_json::to_vec(&SyncJobJson {
            mal_id: job.mal_id(),
            event_id: job.event_id().map(str::to_string),
        })?;
        self.log.publish(job.subject(), Bytes::from(body)).await?;
        info!(subject = %job.subject(), mal_id = job.mal_id(), "Sync job requested");
        Ok(())
    }
}
