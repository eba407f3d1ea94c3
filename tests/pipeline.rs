//! End-to-end pipeline over the in-memory backends.
//!
//! Run with: cargo test --test pipeline -- --nocapture
//!
//! Outbox rows are relayed by the publisher to a mock log, redelivered to
//! a durable consumer as the broker would after crashes, and applied once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventrelay::bus::outbox::{MemoryOutboxStore, OutboxConfig, OutboxPublisher};
use eventrelay::bus::{MockDelivery, MockEventLog, MockSource};
use eventrelay::consumer::{ConsumerConfig, Dedup, DurableConsumer, Outcome};
use eventrelay::dlq::LogDeadLetterPublisher;
use eventrelay::events::subjects;
use eventrelay::handlers::{EffectError, IngestionJobHandler, JobProducer, ReindexHandler, SearchIndexer, SyncJobs};
use eventrelay::idempotency::MemoryIdempotencyStore;
use serde_json::json;
use tokio::sync::watch;

#[derive(Default)]
struct RecordingIndexer {
    reindexed: Mutex<Vec<String>>,
}

impl RecordingIndexer {
    fn reindexed(&self) -> Vec<String> {
        self.reindexed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchIndexer for RecordingIndexer {
    async fn reindex_anime(&self, anime_id: &str) -> Result<(), EffectError> {
        self.reindexed.lock().unwrap().push(anime_id.to_string());
        Ok(())
    }
}

fn outbox_config() -> OutboxConfig {
    OutboxConfig {
        batch_size: 10,
        poll_interval_ms: 10,
        ..OutboxConfig::default()
    }
}

fn reindex_consumer(
    source: Arc<MockSource>,
    indexer: Arc<RecordingIndexer>,
    dlq_log: Arc<MockEventLog>,
) -> DurableConsumer<ReindexHandler> {
    DurableConsumer::new(
        ConsumerConfig {
            fetch_wait_ms: 10,
            ..ConsumerConfig::new("search-reindex", "CATALOG_EVENTS", subjects::ANIME_UPSERTED, "search_reindex")
        },
        source,
        ReindexHandler::new(indexer),
        Dedup::Store(Arc::new(MemoryIdempotencyStore::default())),
        Arc::new(LogDeadLetterPublisher::new(dlq_log, "catalog.dlq")),
    )
}

/// Deliveries for everything the log holds, as first delivered.
async fn deliveries(log: &MockEventLog) -> Vec<MockDelivery> {
    log.published()
        .await
        .into_iter()
        .map(|(subject, payload)| MockDelivery::new(subject, payload, 1))
        .collect()
}

#[tokio::test]
async fn test_outbox_to_consumer_applies_each_event_once() {
    let store = MemoryOutboxStore::new();
    let log = Arc::new(MockEventLog::new());
    for anime_id in ["a1", "a2", "a3"] {
        store
            .enqueue(subjects::ANIME_UPSERTED, &json!({ "anime_id": anime_id }))
            .unwrap();
    }

    let publisher = OutboxPublisher::new(Arc::new(store.clone()), log.clone(), outbox_config());
    assert_eq!(publisher.flush_once().await.unwrap(), 3);

    let indexer = Arc::new(RecordingIndexer::default());
    let consumer = reindex_consumer(Arc::new(MockSource::new()), indexer.clone(), Arc::new(MockEventLog::new()));

    for delivery in deliveries(&log).await {
        assert_eq!(consumer.process(&delivery).await, Outcome::Applied);
        // Ack lost: the broker redelivers
        assert_eq!(consumer.process(&delivery.redelivered()).await, Outcome::Duplicate);
    }

    assert_eq!(indexer.reindexed(), vec!["a1", "a2", "a3"]);
    assert_eq!(store.unpublished_count(), 0);
}

#[tokio::test]
async fn test_partial_publish_failure_is_deduplicated_downstream() {
    let store = MemoryOutboxStore::new();
    let log = Arc::new(MockEventLog::new());
    for anime_id in ["a1", "a2", "a3"] {
        store
            .enqueue(subjects::ANIME_UPSERTED, &json!({ "anime_id": anime_id }))
            .unwrap();
    }
    let publisher = OutboxPublisher::new(Arc::new(store.clone()), log.clone(), outbox_config());

    log.set_fail_after(Some(2)).await;
    assert!(publisher.flush_once().await.is_err());
    assert_eq!(store.unpublished_count(), 3);

    log.set_fail_after(None).await;
    assert_eq!(publisher.flush_once().await.unwrap(), 3);
    // a1 and a2 went out twice
    assert_eq!(log.published_count().await, 5);

    let indexer = Arc::new(RecordingIndexer::default());
    let consumer = reindex_consumer(Arc::new(MockSource::new()), indexer.clone(), Arc::new(MockEventLog::new()));
    let mut outcomes = Vec::new();
    for delivery in deliveries(&log).await {
        outcomes.push(consumer.process(&delivery).await);
    }

    assert_eq!(
        outcomes,
        vec![
            Outcome::Applied,
            Outcome::Applied,
            Outcome::Duplicate,
            Outcome::Duplicate,
            Outcome::Applied
        ]
    );
    assert_eq!(indexer.reindexed(), vec!["a1", "a2", "a3"]);
}

#[tokio::test]
async fn test_publisher_and_consumer_loops_shut_down_cleanly() {
    let store = MemoryOutboxStore::new();
    let log = Arc::new(MockEventLog::new());
    let source = Arc::new(MockSource::new());
    let indexer = Arc::new(RecordingIndexer::default());
    let consumer = Arc::new(reindex_consumer(source.clone(), indexer.clone(), Arc::new(MockEventLog::new())));
    let publisher = Arc::new(OutboxPublisher::new(Arc::new(store.clone()), log.clone(), outbox_config()));

    let (tx, rx) = watch::channel(false);
    let publisher_task = {
        let publisher = publisher.clone();
        let rx = rx.clone();
        tokio::spawn(async move { publisher.run(rx).await })
    };
    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(rx).await })
    };

    store
        .enqueue(subjects::ANIME_UPSERTED, &json!({ "anime_id": "a1" }))
        .unwrap();

    // Relay whatever the publisher emits to the consumer's source
    for _ in 0..200 {
        for (subject, payload) in log.take_published().await {
            source.push(MockDelivery::new(subject, payload, 1)).await;
        }
        if !indexer.reindexed().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), publisher_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), consumer_task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(indexer.reindexed(), vec!["a1"]);
    assert_eq!(log.ensured_streams().await[0].name, "CATALOG_EVENTS");
}

#[tokio::test]
async fn test_exhausted_event_lands_on_dlq_subject() {
    let dlq_log = Arc::new(MockEventLog::new());
    let indexer = Arc::new(RecordingIndexer::default());
    let consumer = reindex_consumer(Arc::new(MockSource::new()), indexer.clone(), dlq_log.clone());
    let delivery = MockDelivery::new(subjects::ANIME_UPSERTED, &b"{\"anime_id\":\"a9\"}"[..], 6);

    assert_eq!(consumer.process(&delivery).await, Outcome::DeadLettered);

    assert!(indexer.reindexed().is_empty());
    assert_eq!(
        dlq_log.published_json("catalog.dlq").await,
        vec![json!({
            "subject": "catalog.anime.upserted",
            "reason": "max deliveries exceeded: 6",
            "payload": {"anime_id": "a9"}
        })]
    );
}

#[derive(Default)]
struct RecordingJobs {
    synced: Mutex<Vec<i64>>,
}

#[async_trait]
impl SyncJobs for RecordingJobs {
    async fn sync_jikan(&self, mal_id: i64) -> Result<(), EffectError> {
        self.synced.lock().unwrap().push(mal_id);
        Ok(())
    }

    async fn sync_hianime(&self, _mal_id: i64) -> Result<(), EffectError> {
        Err("hianime disabled".into())
    }
}

#[tokio::test]
async fn test_job_producer_feeds_ingestion_consumer() {
    let log = Arc::new(MockEventLog::new());
    let producer = JobProducer::new(log.clone());
    producer.request_jikan_sync(21).await.unwrap();
    producer.request_hianime_sync(21).await.unwrap();

    let jobs = Arc::new(RecordingJobs::default());
    let consumer = DurableConsumer::new(
        ConsumerConfig::new("ingestion", "INGESTION_JOBS", "ingestion.*.sync", "ingestion_sync"),
        Arc::new(MockSource::new()),
        IngestionJobHandler::new(jobs.clone()),
        Dedup::Store(Arc::new(MemoryIdempotencyStore::default())),
        Arc::new(LogDeadLetterPublisher::new(log.clone(), "ingestion.dlq")),
    );

    let outcomes: Vec<Outcome> = {
        let mut outcomes = Vec::new();
        for delivery in deliveries(&log).await {
            outcomes.push(consumer.process(&delivery).await);
        }
        outcomes
    };

    assert_eq!(outcomes, vec![Outcome::Applied, Outcome::Retried(Duration::from_secs(1))]);
    assert_eq!(*jobs.synced.lock().unwrap(), vec![21]);
}
