//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Provides a trait-based abstraction for parking messages that exhausted
//! their deliveries, for manual review and replay.
//!
//! ## Subject Naming
//!
//! DLQ subjects follow the pattern: `{domain}.dlq`, e.g. `ingestion.dlq`,
//! so the domain's stream wildcard (`ingestion.>`) captures them.
//!
//! ## Message Format
//!
//! ```json
//! {"subject": "ingestion.jikan.sync", "reason": "max deliveries exceeded: 6", "payload": {"mal_id": 1}}
//! ```
//!
//! The original payload is embedded verbatim when it is valid JSON and as
//! a JSON string (lossy UTF-8) otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::EventLog;

/// DLQ subject for a domain.
pub fn dlq_subject_for_domain(domain: &str) -> String {
    format!("{}.dlq", domain)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// A message that will not be processed again.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Subject the message was consumed from.
    pub subject: String,
    pub reason: String,
    /// Original payload bytes.
    pub payload: Bytes,
}

#[derive(Serialize)]
struct DeadLetterJson<'a> {
    subject: &'a str,
    reason: &'a str,
    payload: EmbeddedPayload<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EmbeddedPayload<'a> {
    Json(&'a RawValue),
    Text(String),
}

impl DeadLetter {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
            payload: payload.into(),
        }
    }

    /// Dead letter for a message seen more often than the delivery budget.
    pub fn max_deliveries_exceeded(subject: &str, num_delivered: u64, payload: &[u8]) -> Self {
        Self::new(
            subject,
            format!("max deliveries exceeded: {}", num_delivered),
            Bytes::copy_from_slice(payload),
        )
    }

    /// Payload as text for logs, lossy on invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Wire encoding.
    pub fn to_json(&self) -> Result<Vec<u8>, DlqError> {
        let raw = std::str::from_utf8(&self.payload)
            .ok()
            .and_then(|s| serde_json::from_str::<&RawValue>(s).ok());
        let payload = match raw {
            Some(raw) => EmbeddedPayload::Json(raw),
            None => EmbeddedPayload::Text(self.payload_text()),
        };

        Ok(serde_json::to_vec(&DeadLetterJson {
            subject: &self.subject,
            reason: &self.reason,
            payload,
        })?)
    }
}

/// Trait for publishing messages to a dead letter queue.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter to the queue.
    ///
    /// Returns Ok(()) only once the dead letter is durably recorded.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// DLQ publisher writing to a subject on the event log.
pub struct LogDeadLetterPublisher {
    log: Arc<dyn EventLog>,
    subject: String,
}

impl LogDeadLetterPublisher {
    pub fn new(log: Arc<dyn EventLog>, subject: impl Into<String>) -> Self {
        Self {
            log,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl DeadLetterPublisher for LogDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let body = dead_letter.to_json()?;
        self.log
            .publish(&self.subject, Bytes::from(body))
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;
        info!(
            dlq = %self.subject,
            subject = %dead_letter.subject,
            reason = %dead_letter.reason,
            "Published dead letter"
        );
        Ok(())
    }
}

/// No-op DLQ publisher that logs but doesn't actually send anywhere.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            subject = %dead_letter.subject,
            reason = %dead_letter.reason,
            payload = %dead_letter.payload_text(),
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory DLQ publisher using a channel.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Create a new channel-based DLQ publisher.
    ///
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        debug!(subject = %dead_letter.subject, reason = %dead_letter.reason, "Publishing to channel DLQ");
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// Create a DLQ publisher for `subject`, or a noop one when unset.
pub fn create_publisher(log: Arc<dyn EventLog>, subject: Option<&str>) -> Arc<dyn DeadLetterPublisher> {
    match subject.filter(|s| !s.is_empty()) {
        Some(subject) => Arc::new(LogDeadLetterPublisher::new(log, subject)),
        None => {
            debug!("No DLQ subject configured, using noop publisher");
            Arc::new(NoopDeadLetterPublisher)
        }
    }
}
