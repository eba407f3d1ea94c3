//! Event envelope carrying the idempotency key.
//!
//! Every event published through this crate is a JSON object with an
//! `event_id` and `created_at` next to the event's own fields. The id is
//! assigned once when the event is produced; retries and redeliveries
//! carry the same id, which is what consumers deduplicate on.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusError, EventLog};

/// Envelope wrapping an event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> EventEnvelope<T> {
    /// Wrap `body` with a freshly generated event id.
    pub fn new(body: T) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body)
    }

    /// Wrap `body` with a caller-assigned event id.
    pub fn with_id(event_id: impl Into<String>, body: T) -> Self {
        Self {
            event_id: event_id.into(),
            created_at: Utc::now(),
            body,
        }
    }
}

/// Errors from envelope publishing.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publishes enveloped JSON events directly to the log.
///
/// For producers without an outbox, where losing an event on a crash
/// between the business write and the publish is acceptable.
#[derive(Clone)]
pub struct EnvelopePublisher {
    log: Arc<dyn EventLog>,
}

impl EnvelopePublisher {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Stamp, serialize and publish `body` to `subject`. Returns the event id.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        subject: &str,
        body: &T,
    ) -> Result<String, EnvelopeError> {
        let envelope = EventEnvelope::new(body);
        let payload = serde_json::to_vec(&envelope)?;
        self.log.publish(subject, Bytes::from(payload)).await?;
        debug!(subject = %subject, event_id = %envelope.event_id, "Published event");
        Ok(envelope.event_id)
    }
}
