//! Crawl job orchestration and self-healing supervisor.
//!
//! Operates a fleet of long-running containerized crawl jobs on a single
//! host: claims the next unit of work, supervises the crawl container
//! alongside a progress/stall monitor, applies bounded self-healing
//! (worker reduction, container restart, VPN rotation), and classifies
//! failures so transient infrastructure trouble is never charged against
//! a job's retry budget.
//!
//! The library is consumed by two binaries: `supervisor` (the worker
//! loop) and `watchdog` (out-of-process stale-job recovery).

pub mod config;
pub mod error;
pub mod guardrails;
pub mod jobs;
pub mod monitor;
pub mod stage;
pub mod state;
pub mod strategies;
pub mod watchdog;

pub use config::SupervisorConfig;
pub use error::{classify_failure, CrawlError, FailureClass};
pub use jobs::{Job, JobStatus, JobStore, WorkerLoop};
pub use monitor::Verdict;
pub use state::RunState;
