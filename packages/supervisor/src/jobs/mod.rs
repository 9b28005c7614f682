//! Job records, the shared store, and the worker loop.
//!
//! The supervisor owns a job's status transitions from `queued` through
//! the crawl-terminal states; indexing and the API layer own the rest.

pub mod admin;
mod job;
mod store;
pub mod testing;
mod worker;

pub use job::{CrawlerStatus, Job, JobConfig, JobStatus, ToolOptions};
pub use store::{JobStore, PostgresJobStore};
pub use worker::{
    CommandIndexer, Indexer, NoopIndexer, PollOutcome, WorkerConfig, WorkerLoop,
    INFRA_ERROR_COOLDOWN_MINUTES, MAX_CRAWL_RETRIES,
};
