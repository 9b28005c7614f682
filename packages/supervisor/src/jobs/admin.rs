//! Administrative bulk operations over job records.
//!
//! Bulk mutations take a per-job advisory file lock first, and the worker
//! loop holds the same lock while it processes a job, so an operator
//! resetting retry counters can never race a live worker on the same job.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::job::{Job, JobStatus};
use super::store::JobStore;

/// Lock file co-located with the job's output.
fn lock_path(output_dir: &Path) -> PathBuf {
    output_dir.join(".job.lock")
}

/// Held advisory lock on one job. Released on drop.
#[derive(Debug)]
pub struct JobLock {
    _file: File,
}

fn open_lock_file(output_dir: &Path) -> Result<File> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output dir {}", output_dir.display()))?;
    let path = lock_path(output_dir);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening job lock {}", path.display()))
}

/// Block until the job's lock is held (worker side).
pub fn lock_job(job: &Job) -> Result<JobLock> {
    let file = open_lock_file(&job.output_path())?;
    file.lock_exclusive().context("locking job")?;
    Ok(JobLock { _file: file })
}

/// Try to take the job's lock without blocking (admin side). `None`
/// means a live worker holds the job.
pub fn try_lock_job(job: &Job) -> Result<Option<JobLock>> {
    let file = open_lock_file(&job.output_path())?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(JobLock { _file: file })),
        Err(_) => Ok(None),
    }
}

/// Summary of a bulk retry-counter reset.
#[derive(Debug, Default)]
pub struct ResetSummary {
    pub reset: Vec<Uuid>,
    /// Jobs skipped because a worker currently holds them.
    pub skipped_locked: Vec<Uuid>,
}

/// Reset retry counters for all terminally `failed` jobs and return them
/// to the queue, skipping any job a worker currently holds.
pub async fn reset_retry_counters(store: &dyn JobStore) -> Result<ResetSummary> {
    let mut summary = ResetSummary::default();
    for job in store.list_by_status(JobStatus::Failed).await? {
        match try_lock_job(&job)? {
            Some(_lock) => {
                store.reset_retry_count(job.id).await?;
                store.mark_retryable(job.id, "retry_counters_reset").await?;
                info!(job_id = %job.id, source = %job.source, "reset retry counter");
                summary.reset.push(job.id);
            }
            None => {
                debug!(job_id = %job.id, "job locked by a worker, skipping");
                summary.skipped_locked.push(job.id);
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::InMemoryJobStore;
    use crate::jobs::JobConfig;
    use std::sync::Arc;

    fn failed_job(output_dir: &Path) -> Job {
        let mut job = Job::queued(
            "example.org",
            output_dir.to_str().unwrap(),
            JobConfig::default(),
        );
        job.status = JobStatus::Failed;
        job.retry_count = 3;
        job
    }

    #[tokio::test]
    async fn test_reset_returns_failed_jobs_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let job = failed_job(&dir.path().join("a"));
        let job_id = job.id;
        store.insert(job);

        let summary = reset_retry_counters(store.as_ref()).await.unwrap();
        assert_eq!(summary.reset, vec![job_id]);

        let job = store.get(job_id).unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.status, JobStatus::Retryable);
    }

    #[tokio::test]
    async fn test_reset_skips_jobs_held_by_a_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let job = failed_job(&dir.path().join("a"));
        let job_id = job.id;
        store.insert(job.clone());

        let _held = lock_job(&job).unwrap();
        let summary = reset_retry_counters(store.as_ref()).await.unwrap();
        assert!(summary.reset.is_empty());
        assert_eq!(summary.skipped_locked, vec![job_id]);
        assert_eq!(store.get(job_id).unwrap().retry_count, 3);
    }
}
