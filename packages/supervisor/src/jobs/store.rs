//! Shared job store access.
//!
//! The `crawl_jobs` table and its migrations are owned by the API layer;
//! this module only claims, reads, and updates rows. The worker loop and
//! watchdog talk to [`JobStore`] so tests can substitute the in-memory
//! store from [`super::testing`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{Job, JobStatus};

/// Columns selected for every job read; keep in sync with [`Job`].
const JOB_COLUMNS: &str = "id, source, output_dir, status, retry_count, crawler_exit_code, \
     crawler_status, crawler_status_at, crawler_stage, pages_crawled, pages_total, \
     pages_failed, annual, progress_log, config, queued_at, started_at, created_at, updated_at";

/// Store of crawl job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim the next eligible job: oldest `queued`/`retryable` by queue
    /// time then creation time, excluding `infra_error` jobs still inside
    /// the cooldown window. A claimed job is marked `running` with
    /// `started_at` set.
    async fn claim_next(&self, infra_cooldown: Duration) -> Result<Option<Job>>;

    /// Persist the job's mutable fields.
    async fn save(&self, job: &Job) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    /// All jobs currently marked `running` (watchdog input).
    async fn list_running(&self) -> Result<Vec<Job>>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Return a stuck job to the queue with a recovery stage label.
    async fn mark_retryable(&self, id: Uuid, stage: &str) -> Result<()>;

    /// Administrative reset of a job's retry budget.
    async fn reset_retry_count(&self, id: Uuid) -> Result<()>;
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn claim_next(&self, infra_cooldown: Duration) -> Result<Option<Job>> {
        // Single-row claim with SKIP LOCKED so a concurrent admin session
        // holding a row never blocks the poll.
        let query = format!(
            r#"
            UPDATE crawl_jobs
            SET status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM crawl_jobs
                WHERE status IN ('queued', 'retryable')
                  AND (crawler_status <> 'infra_error'
                       OR crawler_status_at IS NULL
                       OR crawler_status_at < NOW() - ($1 || ' seconds')::INTERVAL)
                ORDER BY queued_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(infra_cooldown.num_seconds().to_string())
            .fetch_optional(&self.pool)
            .await
            .context("claiming next crawl job")?;
        Ok(job)
    }

    async fn save(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = $1,
                retry_count = $2,
                crawler_exit_code = $3,
                crawler_status = $4,
                crawler_status_at = $5,
                crawler_stage = $6,
                pages_crawled = $7,
                pages_total = $8,
                pages_failed = $9,
                progress_log = $10,
                started_at = $11,
                updated_at = NOW()
            WHERE id = $12
            "#,
        )
        .bind(job.status)
        .bind(job.retry_count)
        .bind(job.crawler_exit_code)
        .bind(job.crawler_status)
        .bind(job.crawler_status_at)
        .bind(&job.crawler_stage)
        .bind(job.pages_crawled)
        .bind(job.pages_total)
        .bind(job.pages_failed)
        .bind(&job.progress_log)
        .bind(job.started_at)
        .bind(job.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving crawl job {}", job.id))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading crawl job {id}"))?;
        Ok(job)
    }

    async fn list_running(&self) -> Result<Vec<Job>> {
        self.list_by_status(JobStatus::Running).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let query =
            format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE status = $1 ORDER BY queued_at");
        let jobs = sqlx::query_as::<_, Job>(&query)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .context("listing crawl jobs by status")?;
        Ok(jobs)
    }

    async fn mark_retryable(&self, id: Uuid, stage: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'retryable',
                crawler_stage = $1,
                queued_at = NOW(),
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(stage)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking crawl job {id} retryable"))?;
        Ok(())
    }

    async fn reset_retry_count(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET retry_count = 0,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("resetting retry count for crawl job {id}"))?;
        Ok(())
    }
}
