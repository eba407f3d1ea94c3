//! Ingestion sync jobs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::EffectError;
use crate::consumer::{Applied, EventHandler, HandleError, MessageContext};
use crate::events::IngestionJob;

/// Upstream sync operations. Both are upserts keyed by `mal_id`, so
/// running one twice leaves the same state.
#[async_trait]
pub trait SyncJobs: Send + Sync {
    async fn sync_jikan(&self, mal_id: i64) -> Result<(), EffectError>;

    async fn sync_hianime(&self, mal_id: i64) -> Result<(), EffectError>;
}

/// Consumes `ingestion.*.sync`.
///
/// Jobs carrying an `event_id` go through the idempotency store; jobs
/// without one are plain re-syncs and run on every delivery.
pub struct IngestionJobHandler {
    jobs: Arc<dyn SyncJobs>,
}

impl IngestionJobHandler {
    pub fn new(jobs: Arc<dyn SyncJobs>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl EventHandler for IngestionJobHandler {
    type Event = IngestionJob;

    fn decode(&self, subject: &str, payload: &[u8]) -> Result<IngestionJob, HandleError> {
        Ok(IngestionJob::decode(subject, payload)?)
    }

    fn validate(&self, job: &IngestionJob) -> Result<(), HandleError> {
        Ok(job.validate()?)
    }

    fn event_id<'e>(&self, job: &'e IngestionJob) -> Option<&'e str> {
        job.event_id()
    }

    async fn apply(&self, job: &IngestionJob, ctx: &MessageContext<'_>) -> Result<Applied, HandleError> {
        let result = match job {
            IngestionJob::JikanSync { mal_id, .. } => self.jobs.sync_jikan(*mal_id).await,
            IngestionJob::HiAnimeSync { mal_id, .. } => self.jobs.sync_hianime(*mal_id).await,
        };
        result.map_err(|e| HandleError::Transient(format!("{} mal_id={}: {}", ctx.subject, job.mal_id(), e)))?;
        info!(subject = %ctx.subject, mal_id = job.mal_id(), "Sync job completed");
        Ok(Applied::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::bus::{MockDelivery, MockSource};
    use crate::consumer::{ConsumerConfig, Dedup, DurableConsumer, Outcome};
    use crate::dlq::ChannelDeadLetterPublisher;
    use crate::events::subjects;
    use crate::idempotency::MemoryIdempotencyStore;

    #[derive(Default)]
    struct RecordingJobs {
        runs: Mutex<Vec<(&'static str, i64)>>,
        failing: bool,
    }

    #[async_trait]
    impl SyncJobs for RecordingJobs {
        async fn sync_jikan(&self, mal_id: i64) -> Result<(), EffectError> {
            if self.failing {
                return Err("jikan rate limited".into());
            }
            self.runs.lock().unwrap().push(("jikan", mal_id));
            Ok(())
        }

        async fn sync_hianime(&self, mal_id: i64) -> Result<(), EffectError> {
            self.runs.lock().unwrap().push(("hianime", mal_id));
            Ok(())
        }
    }

    fn consumer(jobs: Arc<RecordingJobs>, dlq: ChannelDeadLetterPublisher) -> DurableConsumer<IngestionJobHandler> {
        DurableConsumer::new(
            ConsumerConfig::new("ingestion", "INGESTION_JOBS", "ingestion.*.sync", "ingestion_sync")
                .with_dlq("ingestion.dlq"),
            Arc::new(MockSource::new()),
            IngestionJobHandler::new(jobs),
            Dedup::Store(Arc::new(MemoryIdempotencyStore::default())),
            Arc::new(dlq),
        )
    }

    #[tokio::test]
    async fn test_jobs_dispatch_by_subject() {
        let jobs = Arc::new(RecordingJobs::default());
        let (dlq, _rx) = ChannelDeadLetterPublisher::new();
        let consumer = consumer(jobs.clone(), dlq);

        let jikan = MockDelivery::json(subjects::JIKAN_SYNC, &json!({"mal_id": 1}), 1);
        let hianime = MockDelivery::json(subjects::HIANIME_SYNC, &json!({"mal_id": 2}), 1);
        assert_eq!(consumer.process(&jikan).await, Outcome::Applied);
        assert_eq!(consumer.process(&hianime).await, Outcome::Applied);

        assert_eq!(*jobs.runs.lock().unwrap(), vec![("jikan", 1), ("hianime", 2)]);
    }

    #[tokio::test]
    async fn test_job_without_event_id_reruns() {
        let jobs = Arc::new(RecordingJobs::default());
        let (dlq, _rx) = ChannelDeadLetterPublisher::new();
        let consumer = consumer(jobs.clone(), dlq);
        let delivery = MockDelivery::json(subjects::JIKAN_SYNC, &json!({"mal_id": 7}), 1);

        consumer.process(&delivery).await;
        consumer.process(&delivery.redelivered()).await;

        assert_eq!(jobs.runs.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_job_is_dead_lettered_after_budget() {
        let jobs = Arc::new(RecordingJobs {
            failing: true,
            ..RecordingJobs::default()
        });
        let (dlq, mut dead_letters) = ChannelDeadLetterPublisher::new();
        let consumer = consumer(jobs, dlq);

        let mut delivery = MockDelivery::json(subjects::JIKAN_SYNC, &json!({"mal_id": 9}), 1);
        for attempt in 1..=5u32 {
            let outcome = consumer.process(&delivery).await;
            assert_eq!(outcome, Outcome::Retried(std::time::Duration::from_secs(1 << (attempt - 1))));
            delivery = delivery.redelivered();
        }

        assert_eq!(consumer.process(&delivery).await, Outcome::DeadLettered);
        let dead_letter = dead_letters.try_recv().unwrap();
        assert_eq!(dead_letter.reason, "max deliveries exceeded: 6");
        assert_eq!(dead_letter.to_json().unwrap(), br#"{"subject":"ingestion.jikan.sync","reason":"max deliveries exceeded: 6","payload":{"mal_id":9}}"#.to_vec());
    }

    #[tokio::test]
    async fn test_non_positive_mal_id_is_invalid() {
        let (dlq, _rx) = ChannelDeadLetterPublisher::new();
        let consumer = consumer(Arc::new(RecordingJobs::default()), dlq);
        let delivery = MockDelivery::json(subjects::HIANIME_SYNC, &json!({"mal_id": -3}), 1);

        assert_eq!(consumer.process(&delivery).await, Outcome::Invalid);
    }
}
