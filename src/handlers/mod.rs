//! Concrete consumers and the producer that feeds them.
//!
//! - `reindex`: catalog upserts to the search index, deduplicated via
//!   the idempotency store
//! - `ingestion`: sync jobs, run against a `SyncJobs` implementation
//! - `progress`: watch progress, transactional
//! - `comments`: comment mutations and votes, transactional
//! - `jobs`: publishes sync jobs
//!
//! External effects (search index, upstream sync) sit behind traits so the
//! consumers can be driven by in-memory doubles.

#[cfg(feature = "postgres")]
pub mod comments;
pub mod ingestion;
pub mod jobs;
#[cfg(feature = "postgres")]
pub mod progress;
pub mod reindex;

#[cfg(feature = "postgres")]
pub use comments::CommentsHandler;
pub use ingestion::{IngestionJobHandler, SyncJobs};
pub use jobs::{JobError, JobProducer};
#[cfg(feature = "postgres")]
pub use progress::ProgressHandler;
pub use reindex::{ReindexHandler, SearchIndexer};

/// Error returned by external effect implementations.
pub type EffectError = Box<dyn std::error::Error + Send + Sync>;
