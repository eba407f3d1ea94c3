//! eventrelay-publisher: outbox relay
//!
//! Polls the outbox table and relays unpublished rows to JetStream, one
//! claimed batch at a time. Any number of replicas can run against the
//! same table; `SKIP LOCKED` keeps their batches disjoint.
//!
//! ## Architecture
//! ```text
//! [catalog tx] -> [catalog_outbox] -> [eventrelay-publisher] -> [CATALOG_EVENTS]
//! ```
//!
//! ## Configuration
//! - EVENTRELAY__STORAGE__POSTGRES__URI: database holding the outbox table
//! - EVENTRELAY__MESSAGING__NATS__URL: NATS server
//! - EVENTRELAY__OUTBOX__*: table, batch size, poll interval, retention

use std::sync::Arc;

use tracing::{error, info};

use eventrelay::bus::nats::{self, NatsEventLog};
use eventrelay::bus::outbox::{OutboxPublisher, PostgresOutboxStore};
use eventrelay::config::Config;
use eventrelay::storage::{connect_pool, verify_table};
use eventrelay::supervisor::Supervisor;
use eventrelay::utils::bootstrap::{connect_with_retry, connection_backoff, init_tracing, redact_url};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting eventrelay-publisher");

    let pool = connect_pool(&config.storage.postgres).await?;
    verify_table(&pool, &config.outbox.table).await?;
    let store = Arc::new(PostgresOutboxStore::new(pool, config.outbox.table.clone()));

    let nats_config = &config.messaging.nats;
    let client = connect_with_retry("nats", &redact_url(&nats_config.url), connection_backoff(), || {
        nats::connect(nats_config)
    })
    .await?;
    let log = Arc::new(NatsEventLog::new(client));

    let publisher = OutboxPublisher::new(store, log, config.outbox.clone());

    let mut supervisor = Supervisor::new();
    supervisor.spawn("outbox-publisher", move |shutdown| async move {
        publisher.run(shutdown).await.map_err(Into::into)
    });

    let report = supervisor.run_until_signal().await;
    if !report.is_clean() {
        return Err(format!("tasks failed: {}", report.failed.join(", ")).into());
    }

    info!("eventrelay-publisher stopped");
    Ok(())
}
