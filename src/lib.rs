//! eventrelay - transactional outbox and durable consumers over NATS JetStream.
//!
//! Producers write events into an outbox table inside their business
//! transaction; the outbox publisher relays them to the durable log.
//! Durable pull consumers apply each event at most once using an
//! idempotency store or a transactional ledger, back off on failure,
//! and park exhausted messages on a dead-letter subject.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod events;
pub mod handlers;
pub mod idempotency;
pub mod storage;
pub mod supervisor;
pub mod utils;
