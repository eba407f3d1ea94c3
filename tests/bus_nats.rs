//! NATS JetStream integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_nats --features nats -- --nocapture
//!
//! These tests spin up NATS with JetStream in a container and exercise
//! stream reconciliation, durable pull consumers and redelivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventrelay::bus::{EventLog, MessageSource, NatsEventLog, NatsPullSource, StreamSpec};
use eventrelay::consumer::{
    Applied, ConsumerConfig, Dedup, DurableConsumer, EventHandler, HandleError, MessageContext, Outcome,
};
use eventrelay::dlq::LogDeadLetterPublisher;
use eventrelay::utils::retry::RetryConfig;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start NATS container with JetStream enabled.
async fn start_nats() -> (
    testcontainers::ContainerAsync<GenericImage>,
    async_nats::Client,
) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js"]);

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("nats://{}:{}", host, host_port);
    println!("NATS available at: {}", url);

    let client = async_nats::connect(&url)
        .await
        .expect("Failed to connect to NATS");

    (container, client)
}

fn test_prefix() -> String {
    format!("test{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

struct Spec {
    prefix: String,
    stream: StreamSpec,
}

fn spec() -> Spec {
    let prefix = test_prefix();
    let stream = StreamSpec::new(prefix.to_uppercase(), &[&format!("{}.>", prefix)]);
    Spec { prefix, stream }
}

#[tokio::test]
async fn test_ensure_stream_creates_and_reconciles() {
    println!("=== test_ensure_stream_creates_and_reconciles ===");
    let (_container, client) = start_nats().await;
    let log = NatsEventLog::new(client);
    let Spec { prefix, stream } = spec();

    log.ensure_stream(&stream).await.expect("create stream");
    log.ensure_stream(&stream).await.expect("ensure is idempotent");

    let widened = stream.clone().with_subject("dlq.extra");
    log.ensure_stream(&widened).await.expect("reconcile subjects");

    let mut js_stream = log.context().get_stream(&stream.name).await.unwrap();
    let info = js_stream.info().await.unwrap();
    assert!(info.config.subjects.contains(&format!("{}.>", prefix)));
    assert!(info.config.subjects.contains(&"dlq.extra".to_string()));
    assert_eq!(info.config.max_age, Duration::from_secs(7 * 24 * 3600));
}

#[tokio::test]
async fn test_ensure_stream_leaves_covering_wildcard_alone() {
    println!("=== test_ensure_stream_leaves_covering_wildcard_alone ===");
    let (_container, client) = start_nats().await;
    let log = NatsEventLog::new(client);
    let Spec { prefix, stream } = spec();
    log.ensure_stream(&stream).await.unwrap();

    let narrower = StreamSpec::new(stream.name.clone(), &[&format!("{}.*.sync", prefix)])
        .with_subject(&format!("{}.dlq", prefix));
    log.ensure_stream(&narrower).await.expect("covered subjects need no update");

    let mut js_stream = log.context().get_stream(&stream.name).await.unwrap();
    let info = js_stream.info().await.unwrap();
    assert_eq!(info.config.subjects, vec![format!("{}.>", prefix)]);
}

#[tokio::test]
async fn test_pull_source_redelivers_nacked_messages() {
    println!("=== test_pull_source_redelivers_nacked_messages ===");
    let (_container, client) = start_nats().await;
    let log = NatsEventLog::new(client);
    let Spec { prefix, stream } = spec();
    log.ensure_stream(&stream).await.unwrap();

    let subject = format!("{}.orders.created", prefix);
    log.publish(&subject, Bytes::from_static(b"{\"n\":1}")).await.unwrap();

    let source = NatsPullSource::bind(log.context(), &stream.name, "orders", &subject)
        .await
        .unwrap();

    let first = source.fetch(10, Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].subject(), subject);
    assert_eq!(first[0].payload(), b"{\"n\":1}");
    assert_eq!(first[0].num_delivered(), 1);
    first[0].nak_with_delay(Duration::from_millis(100)).await.unwrap();

    let mut second = Vec::new();
    for _ in 0..10 {
        second = source.fetch(10, Duration::from_millis(500)).await.unwrap();
        if !second.is_empty() {
            break;
        }
    }
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].num_delivered(), 2);
    second[0].ack().await.unwrap();

    let third = source.fetch(10, Duration::from_millis(500)).await.unwrap();
    assert!(third.is_empty());
}

#[tokio::test]
async fn test_durable_survives_rebind() {
    println!("=== test_durable_survives_rebind ===");
    let (_container, client) = start_nats().await;
    let log = NatsEventLog::new(client);
    let Spec { prefix, stream } = spec();
    log.ensure_stream(&stream).await.unwrap();
    let subject = format!("{}.jobs", prefix);

    for n in 0..3 {
        log.publish(&subject, Bytes::from(format!("{{\"n\":{}}}", n))).await.unwrap();
    }

    {
        let source = NatsPullSource::bind(log.context(), &stream.name, "jobs", &subject).await.unwrap();
        let batch = source.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch.len(), 1);
        batch[0].ack().await.unwrap();
    }

    let source = NatsPullSource::bind(log.context(), &stream.name, "jobs", &subject).await.unwrap();
    let batch = source.fetch(10, Duration::from_secs(2)).await.unwrap();
    let payloads: Vec<&[u8]> = batch.iter().map(|d| d.payload()).collect();
    assert_eq!(payloads, vec![&b"{\"n\":1}"[..], &b"{\"n\":2}"[..]]);
}

/// Fails every apply.
#[derive(Default)]
struct AlwaysFailing {
    attempts: Mutex<Vec<u64>>,
}

#[async_trait]
impl EventHandler for AlwaysFailing {
    type Event = serde_json::Value;

    fn decode(&self, _subject: &str, payload: &[u8]) -> Result<serde_json::Value, HandleError> {
        serde_json::from_slice(payload).map_err(|e| HandleError::Malformed(e.to_string()))
    }

    fn event_id<'e>(&self, _event: &'e serde_json::Value) -> Option<&'e str> {
        None
    }

    async fn apply(&self, _event: &serde_json::Value, ctx: &MessageContext<'_>) -> Result<Applied, HandleError> {
        self.attempts.lock().unwrap().push(ctx.num_delivered);
        Err(HandleError::Transient("downstream unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_consumer_dead_letters_after_max_deliver() {
    println!("=== test_consumer_dead_letters_after_max_deliver ===");
    let (_container, client) = start_nats().await;
    let log = Arc::new(NatsEventLog::new(client));
    let Spec { prefix, stream } = spec();
    log.ensure_stream(&stream).await.unwrap();

    let subject = format!("{}.sync", prefix);
    let dlq_subject = format!("{}.dlq", prefix);
    log.publish(&subject, Bytes::from_static(b"{\"mal_id\":1}")).await.unwrap();

    let source = Arc::new(
        NatsPullSource::bind(log.context(), &stream.name, "sync", &subject)
            .await
            .unwrap(),
    );
    let consumer = DurableConsumer::new(
        ConsumerConfig {
            max_deliver: 2,
            fetch_wait_ms: 500,
            ..ConsumerConfig::new("sync", stream.name.clone(), subject.clone(), "sync")
        },
        source.clone(),
        AlwaysFailing::default(),
        Dedup::None,
        Arc::new(LogDeadLetterPublisher::new(log.clone(), dlq_subject.clone())),
    )
    .with_retry(RetryConfig {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(100),
    });

    let dlq_source = NatsPullSource::bind(log.context(), &stream.name, "dlq", &dlq_subject)
        .await
        .unwrap();

    // Drive the consumer by hand: fetch, process, repeat
    let mut outcomes = Vec::new();
    for _ in 0..20 {
        for delivery in source.fetch(10, Duration::from_millis(500)).await.unwrap() {
            outcomes.push(consumer.process(delivery.as_ref()).await);
        }
        if outcomes.contains(&Outcome::DeadLettered) {
            break;
        }
    }

    assert_eq!(
        outcomes,
        vec![
            Outcome::Retried(Duration::from_millis(50)),
            Outcome::Retried(Duration::from_millis(100)),
            Outcome::DeadLettered
        ]
    );
    assert_eq!(*consumer.handler().attempts.lock().unwrap(), vec![1, 2]);

    let dead = dlq_source.fetch(10, Duration::from_secs(2)).await.unwrap();
    assert_eq!(dead.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(dead[0].payload()).unwrap();
    assert_eq!(body["subject"], subject);
    assert_eq!(body["reason"], "max deliveries exceeded: 3");
    assert_eq!(body["payload"]["mal_id"], 1);
}
