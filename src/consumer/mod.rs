//! Durable pull consumer.
//!
//! A `DurableConsumer` drives one `EventHandler` off one durable consumer
//! on the log. Each delivery runs through a fixed pipeline:
//!
//! 1. Deliveries past `max_deliver` are dead-lettered and acked
//! 2. Decode: a payload that does not parse is poison and is acked
//! 3. Validate: an event breaking a field rule is acked
//! 4. Dedup: `Dedup::Store` checks the idempotency store first
//! 5. Apply: success and duplicates are acked, failures are nacked
//!    with a delay growing in the delivery count
//!
//! Nothing is acked before its effect is durable, so a crash at any point
//! leads to redelivery, and dedup turns redelivery into a no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{Delivery, MessageSource, StreamSpec};
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::events::{subjects, EventError};
use crate::idempotency::IdempotencyStore;
use crate::utils::retry::RetryConfig;

// ============================================================================
// Handler contract
// ============================================================================

/// Errors returned by handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// The payload cannot be decoded. Never retried.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The event decoded but is not acceptable. Never retried.
    #[error("invalid event: {0}")]
    Invalid(String),

    /// The effect failed and may succeed on redelivery.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<EventError> for HandleError {
    fn from(e: EventError) -> Self {
        match e {
            EventError::Malformed(msg) => Self::Malformed(msg),
            EventError::Invalid(msg) => Self::Invalid(msg),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for HandleError {
    fn from(e: sqlx::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Result of a successful `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    /// The handler found the event already recorded in its own ledger.
    Duplicate,
}

/// Raw delivery details passed to `apply`.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub subject: &'a str,
    pub payload: &'a [u8],
    pub num_delivered: u64,
}

/// A typed event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Event: Send + Sync;

    fn decode(&self, subject: &str, payload: &[u8]) -> Result<Self::Event, HandleError>;

    fn validate(&self, event: &Self::Event) -> Result<(), HandleError> {
        let _ = event;
        Ok(())
    }

    /// Dedup key. Events without one are applied on every delivery.
    fn event_id<'e>(&self, event: &'e Self::Event) -> Option<&'e str>;

    async fn apply(
        &self,
        event: &Self::Event,
        ctx: &MessageContext<'_>,
    ) -> Result<Applied, HandleError>;
}

/// Where duplicate deliveries are caught.
#[derive(Clone)]
pub enum Dedup {
    /// Check-and-set in the idempotency store before applying.
    Store(Arc<dyn IdempotencyStore>),
    /// The handler records the event inside its own transaction and
    /// reports `Applied::Duplicate`.
    Transactional,
    /// No deduplication: the effect is naturally idempotent.
    None,
}

/// What `process` did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Duplicate,
    /// Payload could not be decoded; acked.
    Poison,
    /// Payload failed validation; acked.
    Invalid,
    /// Delivery budget exhausted; dead-lettered and acked.
    DeadLettered,
    /// Dead-letter publish failed; nacked with this delay.
    DeadLetterFailed(Duration),
    /// Effect failed; nacked with this delay.
    Retried(Duration),
}

// ============================================================================
// Configuration
// ============================================================================

/// One durable consumer binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Name used in logs.
    pub name: String,
    /// Stream the durable consumer is bound to.
    pub stream: String,
    /// Filter subject (wildcards allowed).
    pub subject: String,
    /// Durable consumer name. Instances sharing it share the work.
    pub durable: String,
    /// Deliveries beyond this count are dead-lettered. 0 disables the
    /// limit. Default: 5.
    pub max_deliver: u64,
    /// Messages per fetch. Default: 10.
    pub batch_size: usize,
    /// Longest wait for a fetch to fill. Default: 2s.
    pub fetch_wait_ms: u64,
    /// Pause after a failed fetch. Default: 1s.
    pub fetch_error_delay_ms: u64,
    /// Dead-letter subject. Unset means dead letters are only logged.
    pub dlq_subject: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            stream: String::new(),
            subject: String::new(),
            durable: String::new(),
            max_deliver: 5,
            batch_size: 10,
            fetch_wait_ms: 2000,
            fetch_error_delay_ms: 1000,
            dlq_subject: None,
        }
    }
}

impl ConsumerConfig {
    pub fn new(
        name: impl Into<String>,
        stream: impl Into<String>,
        subject: impl Into<String>,
        durable: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            stream: stream.into(),
            subject: subject.into(),
            durable: durable.into(),
            ..Self::default()
        }
    }

    pub fn with_dlq(mut self, subject: impl Into<String>) -> Self {
        self.dlq_subject = Some(subject.into());
        self
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    pub fn fetch_error_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_error_delay_ms)
    }
}

/// How a deployed consumer catches duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// The handler's ledger row only.
    #[default]
    Transactional,
    /// Check the shared idempotency store before the handler runs.
    Store,
}

/// A consumer as deployed by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub enabled: bool,
    /// Database holding the handler's tables. Falls back to
    /// `storage.postgres.uri`.
    pub database_url: Option<String>,
    /// Processed-events ledger table.
    pub processed_table: String,
    /// Stream covering the consumer's subjects and its DLQ subject.
    pub stream: StreamSpec,
    pub dedup: DedupMode,
    pub consumer: ConsumerConfig,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: None,
            processed_table: "processed_events".to_string(),
            stream: StreamSpec::default(),
            dedup: DedupMode::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl ConsumerSection {
    /// The section's stream, extended to capture the consumer subject and
    /// the DLQ subject.
    pub fn stream_spec(&self) -> StreamSpec {
        let spec = self.stream.clone().with_subject(&self.consumer.subject);
        match self.consumer.dlq_subject.as_deref().filter(|s| !s.is_empty()) {
            Some(dlq) => spec.with_subject(dlq),
            None => spec,
        }
    }

    /// Dedup for this section. `None` when it wants the store and none
    /// was opened.
    pub fn dedup(&self, store: Option<&Arc<dyn IdempotencyStore>>) -> Option<Dedup> {
        match self.dedup {
            DedupMode::Transactional => Some(Dedup::Transactional),
            DedupMode::Store => store.map(|store| Dedup::Store(store.clone())),
        }
    }
}

/// Consumers run by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumersConfig {
    pub progress: ConsumerSection,
    pub comments: ConsumerSection,
}

impl ConsumersConfig {
    fn sections(&self) -> [&ConsumerSection; 2] {
        [&self.progress, &self.comments]
    }

    /// Whether an enabled consumer deduplicates through the idempotency store.
    pub fn needs_store(&self) -> bool {
        self.sections()
            .iter()
            .any(|section| section.enabled && section.dedup == DedupMode::Store)
    }
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            progress: ConsumerSection {
                stream: StreamSpec::new("ACTIVITY_EVENTS", &["activity.>"]),
                consumer: ConsumerConfig::new(
                    "activity-progress",
                    "ACTIVITY_EVENTS",
                    subjects::ACTIVITY_PROGRESS,
                    "activity_progress",
                )
                .with_dlq("activity.dlq"),
                ..ConsumerSection::default()
            },
            comments: ConsumerSection {
                stream: StreamSpec::new("SOCIAL_EVENTS", &["social.>"]),
                consumer: ConsumerConfig::new(
                    "social-comments",
                    "SOCIAL_EVENTS",
                    subjects::COMMENTS_ALL,
                    "social_comments",
                )
                .with_dlq("social.dlq"),
                ..ConsumerSection::default()
            },
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Drives one handler off one durable consumer.
pub struct DurableConsumer<H> {
    config: ConsumerConfig,
    source: Arc<dyn MessageSource>,
    handler: H,
    dedup: Dedup,
    dlq: Arc<dyn DeadLetterPublisher>,
    retry: RetryConfig,
}

impl<H: EventHandler> DurableConsumer<H> {
    pub fn new(
        config: ConsumerConfig,
        source: Arc<dyn MessageSource>,
        handler: H,
        dedup: Dedup,
        dlq: Arc<dyn DeadLetterPublisher>,
    ) -> Self {
        Self {
            config,
            source,
            handler,
            dedup,
            dlq,
            retry: RetryConfig::default(),
        }
    }

    /// Override the redelivery schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Fetch and process batches until shutdown is signalled.
    ///
    /// Shutdown is observed between batches; a batch in progress is
    /// finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            consumer = %self.config.name,
            stream = %self.config.stream,
            subject = %self.config.subject,
            durable = %self.config.durable,
            max_deliver = self.config.max_deliver,
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                fetched = self.source.fetch(self.config.batch_size, self.config.fetch_wait()) => fetched,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match fetched {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        let outcome = self.process(delivery.as_ref()).await;
                        debug!(consumer = %self.config.name, subject = %delivery.subject(), ?outcome, "Delivery processed");
                    }
                }
                Err(e) => {
                    warn!(consumer = %self.config.name, error = %e, "Fetch failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.fetch_error_delay()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(consumer = %self.config.name, "Consumer stopped");
    }

    /// Run one delivery through the pipeline and settle it.
    pub async fn process(&self, delivery: &dyn Delivery) -> Outcome {
        let subject = delivery.subject();
        let num_delivered = delivery.num_delivered().max(1);

        if self.config.max_deliver > 0 && num_delivered > self.config.max_deliver {
            return self.dead_letter(delivery, num_delivered).await;
        }

        let event = match self
            .handler
            .decode(subject, delivery.payload())
            .and_then(|event| self.handler.validate(&event).map(|()| event))
        {
            Ok(event) => event,
            Err(e) => return self.reject(delivery, num_delivered, e).await,
        };
        let event_id = self.handler.event_id(&event);

        let claimed = match (&self.dedup, event_id) {
            (Dedup::Store(store), Some(id)) => match store.check(id).await {
                Ok(true) => {
                    info!(consumer = %self.config.name, %subject, event_id = %id, num_delivered, "Duplicate event skipped");
                    self.ack(delivery).await;
                    return Outcome::Duplicate;
                }
                Ok(false) => Some((store, id)),
                Err(e) => {
                    let delay = self.retry.delay_for_delivery(num_delivered);
                    warn!(consumer = %self.config.name, %subject, event_id = %id, error = %e, "Idempotency check failed");
                    self.nak(delivery, delay).await;
                    return Outcome::Retried(delay);
                }
            },
            _ => None,
        };

        let ctx = MessageContext {
            subject,
            payload: delivery.payload(),
            num_delivered,
        };
        match self.handler.apply(&event, &ctx).await {
            Ok(Applied::Done) => {
                debug!(consumer = %self.config.name, %subject, event_id = ?event_id, num_delivered, "Event applied");
                self.ack(delivery).await;
                Outcome::Applied
            }
            Ok(Applied::Duplicate) => {
                info!(consumer = %self.config.name, %subject, event_id = ?event_id, num_delivered, "Duplicate event skipped");
                self.ack(delivery).await;
                Outcome::Duplicate
            }
            Err(e) if !e.is_transient() => self.reject(delivery, num_delivered, e).await,
            Err(e) => {
                if let Some((store, id)) = claimed {
                    if let Err(release_err) = store.release(id).await {
                        warn!(consumer = %self.config.name, event_id = %id, error = %release_err, "Failed to release idempotency marker");
                    }
                }
                let delay = self.retry.delay_for_delivery(num_delivered);
                warn!(
                    consumer = %self.config.name,
                    %subject,
                    event_id = ?event_id,
                    num_delivered,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Handler failed, scheduling redelivery"
                );
                self.nak(delivery, delay).await;
                Outcome::Retried(delay)
            }
        }
    }

    async fn dead_letter(&self, delivery: &dyn Delivery, num_delivered: u64) -> Outcome {
        let dead_letter =
            DeadLetter::max_deliveries_exceeded(delivery.subject(), num_delivered, delivery.payload());
        let reason = dead_letter.reason.clone();
        let event_id = self.event_id_of(delivery);

        match self.dlq.publish(dead_letter).await {
            Ok(()) => {
                warn!(
                    consumer = %self.config.name,
                    subject = %delivery.subject(),
                    event_id = ?event_id,
                    num_delivered,
                    %reason,
                    "Event dead-lettered"
                );
                self.ack(delivery).await;
                Outcome::DeadLettered
            }
            Err(e) => {
                let delay = self.retry.delay_for_delivery(num_delivered);
                error!(
                    consumer = %self.config.name,
                    subject = %delivery.subject(),
                    event_id = ?event_id,
                    num_delivered,
                    %reason,
                    error = %e,
                    "Dead-letter publish failed, leaving message on the log"
                );
                self.nak(delivery, delay).await;
                Outcome::DeadLetterFailed(delay)
            }
        }
    }

    /// Event id of a delivery, when its payload still decodes.
    fn event_id_of(&self, delivery: &dyn Delivery) -> Option<String> {
        let event = self.handler.decode(delivery.subject(), delivery.payload()).ok()?;
        self.handler.event_id(&event).map(str::to_string)
    }

    async fn reject(&self, delivery: &dyn Delivery, num_delivered: u64, e: HandleError) -> Outcome {
        let outcome = match &e {
            HandleError::Malformed(_) => Outcome::Poison,
            HandleError::Invalid(_) => Outcome::Invalid,
            HandleError::Transient(_) => {
                let delay = self.retry.delay_for_delivery(num_delivered);
                warn!(consumer = %self.config.name, subject = %delivery.subject(), num_delivered, error = %e, "Decode failed transiently");
                self.nak(delivery, delay).await;
                return Outcome::Retried(delay);
            }
        };
        warn!(
            consumer = %self.config.name,
            subject = %delivery.subject(),
            num_delivered,
            reason = %e,
            ?outcome,
            "Event rejected"
        );
        self.ack(delivery).await;
        outcome
    }

    async fn ack(&self, delivery: &dyn Delivery) {
        if let Err(e) = delivery.ack().await {
            warn!(consumer = %self.config.name, subject = %delivery.subject(), error = %e, "Ack failed, message will be redelivered");
        }
    }

    async fn nak(&self, delivery: &dyn Delivery, delay: Duration) {
        if let Err(e) = delivery.nak_with_delay(delay).await {
            warn!(consumer = %self.config.name, subject = %delivery.subject(), error = %e, "Nak failed");
        }
    }
}
