//! Relational storage shared by the consumers.
//!
//! - `schema`: column identifiers and DDL
//! - `processed`: the per-consumer-group processed-events ledger

#[cfg(feature = "postgres")]
pub mod processed;
#[cfg(feature = "postgres")]
pub mod schema;

#[cfg(feature = "postgres")]
pub use processed::{mark_processed, unmark_processed, verify_table, ProcessedEvent};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Required table '{0}' does not exist")]
    MissingTable(String),
}

/// Open a PostgreSQL pool, retrying while the database comes up.
#[cfg(feature = "postgres")]
pub async fn connect_pool(
    config: &crate::config::PostgresConfig,
) -> Result<sqlx::PgPool, sqlx::Error> {
    use crate::utils::bootstrap::{connect_with_retry, connection_backoff, redact_url};

    let address = redact_url(&config.uri);
    connect_with_retry("postgres", &address, connection_backoff(), || {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.uri)
    })
    .await
}
