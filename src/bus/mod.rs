//! Event log abstraction over the durable stream.
//!
//! This module contains:
//! - `EventLog` trait: publishing payloads to subjects on the durable log
//! - `Delivery` / `MessageSource` traits: pull-consumer side of the log
//! - `StreamSpec`: stream shape the publisher and consumers reconcile at startup
//! - Implementations: NATS JetStream, Mock
//! - `outbox`: transactional outbox writer and publisher

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

// Implementation modules
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;
pub mod outbox;

// Re-exports
pub use mock::{MockDelivery, MockEventLog, MockSource};
#[cfg(feature = "nats")]
pub use nats::{NatsDelivery, NatsEventLog, NatsPullSource};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Stream setup failed for '{stream}': {message}")]
    Stream { stream: String, message: String },
}

/// Append side of the durable log.
///
/// Implementations:
/// - `NatsEventLog`: JetStream publish with broker acknowledgement
/// - `MockEventLog`: In-memory recorder for testing
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Publish a payload to a subject.
    ///
    /// Returns once the log has durably accepted the message.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Create the stream described by `spec`, or reconcile an existing one
    /// so it covers every subject in `spec.subjects`.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()>;
}

/// One message handed out by a pull consumer.
///
/// A delivery is settled exactly once, either by `ack` or by
/// `nak_with_delay`. Unsettled deliveries are redelivered by the log
/// after its ack wait.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// Delivery attempt count from the log's metadata. 1 on first delivery.
    fn num_delivered(&self) -> u64;

    async fn ack(&self) -> Result<()>;

    /// Negative-acknowledge, asking for redelivery no sooner than `delay`.
    async fn nak_with_delay(&self, delay: Duration) -> Result<()>;
}

/// Source of deliveries bound to one durable consumer.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `max` deliveries, waiting at most `wait` for them.
    ///
    /// An empty vector means the wait elapsed with nothing available.
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Box<dyn Delivery>>>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Shape of a durable stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,
    /// Subjects (wildcards allowed) captured by the stream.
    pub subjects: Vec<String>,
    /// Maximum message age in seconds. Default: 7 days.
    pub max_age_secs: u64,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: &[&str]) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Subjects of `self` that no pattern in `existing` captures.
    pub fn missing_subjects(&self, existing: &[String]) -> Vec<String> {
        self.subjects
            .iter()
            .filter(|s| !existing.iter().any(|pattern| subject_matches(pattern, s)))
            .cloned()
            .collect()
    }

    /// Whether some subject pattern of the stream captures `subject`.
    pub fn covers(&self, subject: &str) -> bool {
        self.subjects.iter().any(|pattern| subject_matches(pattern, subject))
    }

    /// Add `subject` unless the stream already captures it.
    pub fn with_subject(mut self, subject: &str) -> Self {
        if !self.covers(subject) {
            self.subjects.push(subject.to_string());
        }
        self
    }
}

/// NATS subject matching: `*` matches one token, a trailing `>` one or more.
///
/// A wildcard `subject` is matched token by token, so `a.*` covers `a.*`
/// but not `a.>`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return pattern.next().is_none(),
            (Some("*"), Some(token)) => {
                if token == ">" {
                    return false;
                }
            }
            (Some(p), Some(token)) => {
                if p != token {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            name: "CATALOG_EVENTS".to_string(),
            subjects: vec!["catalog.>".to_string()],
            max_age_secs: 7 * 24 * 60 * 60,
        }
    }
}
