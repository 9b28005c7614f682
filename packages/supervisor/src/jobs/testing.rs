//! In-memory job store for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use super::job::{Job, JobStatus};
use super::store::JobStore;

/// Job store backed by a mutex-guarded map. Selection semantics mirror
/// the Postgres store: oldest eligible by queue time then creation time.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    /// Snapshot of a job for assertions.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_next(&self, infra_cooldown: Duration) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let now = Utc::now();
        let next = jobs
            .values()
            .filter(|j| j.selectable(now, infra_cooldown))
            .min_by_key(|j| (j.queued_at, j.created_at))
            .map(|j| j.id);
        Ok(next.map(|id| {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut updated = job.clone();
        updated.updated_at = Utc::now();
        jobs.insert(job.id, updated);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list_running(&self) -> Result<Vec<Job>> {
        self.list_by_status(JobStatus::Running).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.queued_at);
        Ok(jobs)
    }

    async fn mark_retryable(&self, id: Uuid, stage: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Retryable;
            job.crawler_stage = Some(stage.to_string());
            job.queued_at = Utc::now();
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_retry_count(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.retry_count = 0;
            job.updated_at = Utc::now();
        }
        Ok(())
    }
}
