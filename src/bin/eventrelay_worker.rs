//! eventrelay-worker: durable consumers
//!
//! Runs the activity-progress and social-comments consumers. Both are
//! transactional: the processed-events row and the effect commit together.
//! A section with `dedup: store` also checks the shared idempotency store
//! first. In production the store is opened at startup, and a missing
//! durable backend is fatal.
//!
//! ## Architecture
//! ```text
//! [ACTIVITY_EVENTS] -> [activity_progress] -> [user_episode_progress]
//! [SOCIAL_EVENTS]   -> [social_comments]   -> [comments, comment_votes]
//!        ^                     |
//!        +---- *.dlq <---------+  (deliveries past max_deliver)
//! ```
//!
//! ## Configuration
//! - EVENTRELAY__STORAGE__POSTGRES__URI: default database for both consumers
//! - EVENTRELAY__CONSUMERS__PROGRESS__*: progress consumer section
//! - EVENTRELAY__CONSUMERS__COMMENTS__*: comments consumer section
//! - EVENTRELAY__IDEMPOTENCY__*: idempotency store (redis_url, database_url)

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tracing::{error, info};

use eventrelay::bus::nats::{self, NatsEventLog, NatsPullSource};
use eventrelay::bus::EventLog;
use eventrelay::config::{Config, PostgresConfig};
use eventrelay::consumer::{ConsumerSection, DurableConsumer, EventHandler};
use eventrelay::idempotency::IdempotencyStore;
use eventrelay::dlq;
use eventrelay::handlers::{CommentsHandler, ProgressHandler};
use eventrelay::storage::{connect_pool, verify_table};
use eventrelay::supervisor::Supervisor;
use eventrelay::utils::bootstrap::{connect_with_retry, connection_backoff, init_tracing, redact_url};

type BoxError = Box<dyn std::error::Error>;

/// Pools keyed by connection URL, so consumers sharing a database share a pool.
struct Pools<'a> {
    defaults: &'a PostgresConfig,
    pools: HashMap<String, PgPool>,
}

impl<'a> Pools<'a> {
    fn new(defaults: &'a PostgresConfig) -> Self {
        Self {
            defaults,
            pools: HashMap::new(),
        }
    }

    async fn for_section(&mut self, section: &ConsumerSection) -> Result<PgPool, BoxError> {
        let uri = section
            .database_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.defaults.uri.clone());
        if let Some(pool) = self.pools.get(&uri) {
            return Ok(pool.clone());
        }

        let pool = connect_pool(&PostgresConfig {
            uri: uri.clone(),
            ..self.defaults.clone()
        })
        .await?;
        verify_table(&pool, &section.processed_table).await?;
        self.pools.insert(uri, pool.clone());
        Ok(pool)
    }
}

async fn bind<H: EventHandler>(
    log: &Arc<NatsEventLog>,
    store: Option<&Arc<dyn IdempotencyStore>>,
    section: &ConsumerSection,
    handler: H,
) -> Result<DurableConsumer<H>, BoxError> {
    let dedup = section
        .dedup(store)
        .ok_or_else(|| format!("consumer {} needs an idempotency store", section.consumer.name))?;
    log.ensure_stream(&section.stream_spec()).await?;

    let config = &section.consumer;
    let source = NatsPullSource::bind(log.context(), &config.stream, &config.durable, &config.subject).await?;
    let dlq = dlq::create_publisher(log.clone(), config.dlq_subject.as_deref());

    Ok(DurableConsumer::new(
        config.clone(),
        Arc::new(source),
        handler,
        dedup,
        dlq,
    ))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting eventrelay-worker");

    let nats_config = &config.messaging.nats;
    let client = connect_with_retry("nats", &redact_url(&nats_config.url), connection_backoff(), || {
        nats::connect(nats_config)
    })
    .await?;
    let log = Arc::new(NatsEventLog::new(client));

    let store = config.open_idempotency_store().await.map_err(|e| {
        error!(error = %e, "Idempotency store unavailable");
        e
    })?;
    if let Some(store) = &store {
        info!(backend = store.backend(), "Idempotency store ready");
    }

    let mut pools = Pools::new(&config.storage.postgres);
    let mut supervisor = Supervisor::new();

    let progress = &config.consumers.progress;
    if progress.enabled {
        let pool = pools.for_section(progress).await?;
        let handler = ProgressHandler::new(pool, progress.processed_table.clone());
        let consumer = bind(&log, store.as_ref(), progress, handler).await?;
        supervisor.spawn(progress.consumer.name.clone(), move |shutdown| async move {
            consumer.run(shutdown).await;
            Ok(())
        });
    }

    let comments = &config.consumers.comments;
    if comments.enabled {
        let pool = pools.for_section(comments).await?;
        let handler = CommentsHandler::new(pool, comments.processed_table.clone());
        let consumer = bind(&log, store.as_ref(), comments, handler).await?;
        supervisor.spawn(comments.consumer.name.clone(), move |shutdown| async move {
            consumer.run(shutdown).await;
            Ok(())
        });
    }

    if supervisor.is_empty() {
        return Err("no consumers enabled".into());
    }

    let report = supervisor.run_until_signal().await;
    if !report.is_clean() {
        return Err(format!("tasks failed: {}", report.failed.join(", ")).into());
    }

    info!("eventrelay-worker stopped");
    Ok(())
}
