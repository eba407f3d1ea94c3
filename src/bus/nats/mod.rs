//! NATS JetStream event log implementation.
//!
//! - Streams are file-backed with limits retention and a max age
//! - Publishing waits for the JetStream publish ack before returning
//! - Consumers are durable pull consumers with explicit acks
//!
//! # Configuration
//!
//! ```yaml
//! messaging:
//!   nats:
//!     url: "nats://localhost:4222"
//!     max_reconnects: 60
//! ```
//!
//! Delivery limits are not delegated to the broker: the redelivery
//! threshold and dead-lettering are decided by the consumer loop from
//! the `delivered` count in the message metadata.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{BusError, Delivery, EventLog, MessageSource, Result, StreamSpec};
use crate::config::NatsConfig;

/// Connect to NATS with the configured reconnect policy.
pub async fn connect(config: &NatsConfig) -> Result<async_nats::Client> {
    async_nats::ConnectOptions::new()
        .name(config.client_name.as_str())
        .max_reconnects(config.max_reconnects)
        .connect(config.url.as_str())
        .await
        .map_err(|e| BusError::Connection(format!("{}: {}", config.url, e)))
}

// ============================================================================
// Publish side
// ============================================================================

/// Event log backed by JetStream.
#[derive(Clone)]
pub struct NatsEventLog {
    jetstream: Context,
}

impl NatsEventLog {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            jetstream: jetstream::new(client),
        }
    }

    /// JetStream context, for binding consumers on the same connection.
    pub fn context(&self) -> &Context {
        &self.jetstream
    }
}

#[async_trait]
impl EventLog for NatsEventLog {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(format!("{}: {}", subject, e)))?;
        ack.await
            .map_err(|e| BusError::Publish(format!("{}: ack: {}", subject, e)))?;
        debug!(subject = %subject, "Published to JetStream");
        Ok(())
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()> {
        let stream_err = |message: String| BusError::Stream {
            stream: spec.name.clone(),
            message,
        };

        match self.jetstream.get_stream(&spec.name).await {
            Ok(mut stream) => {
                let current = stream
                    .info()
                    .await
                    .map_err(|e| stream_err(e.to_string()))?
                    .config
                    .clone();
                let missing = spec.missing_subjects(&current.subjects);
                if missing.is_empty() {
                    debug!(stream = %spec.name, "Stream already configured");
                    return Ok(());
                }

                let mut updated = current;
                updated.subjects.extend(missing.iter().cloned());
                self.jetstream
                    .update_stream(&updated)
                    .await
                    .map_err(|e| stream_err(format!("update: {}", e)))?;
                info!(stream = %spec.name, added = ?missing, "Stream subjects reconciled");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(StreamConfig {
                        name: spec.name.clone(),
                        subjects: spec.subjects.clone(),
                        retention: RetentionPolicy::Limits,
                        storage: StorageType::File,
                        max_age: spec.max_age(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| stream_err(format!("create: {}", e)))?;
                info!(stream = %spec.name, subjects = ?spec.subjects, "Stream created");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Consume side
// ============================================================================

/// Durable pull consumer bound to one filter subject.
pub struct NatsPullSource {
    consumer: PullConsumer,
    durable: String,
}

impl NatsPullSource {
    /// Look up or create the durable consumer `durable` on `stream`.
    pub async fn bind(
        jetstream: &Context,
        stream: &str,
        durable: &str,
        filter_subject: &str,
    ) -> Result<Self> {
        let stream = jetstream
            .get_stream(stream)
            .await
            .map_err(|e| BusError::Subscribe(format!("stream {}: {}", stream, e)))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", durable, e)))?;

        info!(durable = %durable, subject = %filter_subject, "Bound durable pull consumer");
        Ok(Self {
            consumer,
            durable: durable.to_string(),
        })
    }
}

#[async_trait]
impl MessageSource for NatsPullSource {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| BusError::Fetch(format!("{}: {}", self.durable, e)))?;

        let mut deliveries: Vec<Box<dyn Delivery>> = Vec::new();
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => deliveries.push(Box::new(NatsDelivery::new(message))),
                Err(e) if deliveries.is_empty() => {
                    return Err(BusError::Fetch(format!("{}: {}", self.durable, e)));
                }
                Err(e) => {
                    // Already-received messages are still processed; the
                    // rest come back after the ack wait.
                    warn!(durable = %self.durable, error = %e, "Batch ended early");
                    break;
                }
            }
        }
        Ok(deliveries)
    }
}

/// A JetStream message with its delivery count read once at receipt.
pub struct NatsDelivery {
    message: jetstream::Message,
    num_delivered: u64,
}

impl NatsDelivery {
    pub fn new(message: jetstream::Message) -> Self {
        let num_delivered = message
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .unwrap_or(1);
        Self {
            message,
            num_delivered,
        }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn num_delivered(&self) -> u64 {
        self.num_delivered
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
