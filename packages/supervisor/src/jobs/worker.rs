//! Job scheduler / worker loop.
//!
//! The outer control loop of the supervisor: strictly one job at a time,
//! it claims the next eligible job, drives the crawl stage to completion
//! (possibly across several stage restarts triggered by adaptations),
//! hands the finished crawl to indexing, and applies the retry
//! bookkeeping rules.
//!
//! # Architecture
//!
//! ```text
//! WorkerLoop
//!     │
//!     ├─► disk headroom guardrail (fail open)
//!     ├─► claim next queued/retryable job (infra-error cooldown applies)
//!     ├─► annual storage-tier guardrail (fail safe)
//!     ├─► stage attempts: container + progress monitor, select!-ed
//!     │       └─► verdicts → bounded adaptation strategies
//!     ├─► classify outcome → retryable / failed / completed
//!     └─► Indexer.index() → indexed / index_failed, then cleanup
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{classify_failure, FailureClass};
use crate::guardrails::{
    self, DiskGauge, StorageTiering, SysinfoDiskGauge,
};
use crate::monitor::{read_latest_status, ProgressMonitor, Verdict};
use crate::stage::ContainerRuntime;
use crate::state::{run_state_path, ErrorCounts, RunState};
use crate::strategies::{apply_adaptations, Outcome, StrategyContext, StrategySettings};

use super::job::{CrawlerStatus, Job, JobStatus, ToolOptions};
use super::store::JobStore;

/// Ordinary failures are retried at most this many times before the job
/// is left terminally `failed`.
pub const MAX_CRAWL_RETRIES: i32 = 3;

/// How long an `infra_error` job is excluded from selection, so an
/// unhealthy mount cannot produce a tight retry storm across the queue.
pub const INFRA_ERROR_COOLDOWN_MINUTES: i64 = 30;

/// Post-crawl indexing, owned by an external collaborator.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, job: &Job) -> Result<()>;
}

/// Indexer invoking an operator-provided command as
/// `<command> <job_id> <output_dir>`.
pub struct CommandIndexer {
    command: String,
}

impl CommandIndexer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Indexer for CommandIndexer {
    async fn index(&self, job: &Job) -> Result<()> {
        let status = tokio::process::Command::new(&self.command)
            .arg(job.id.to_string())
            .arg(&job.output_dir)
            .status()
            .await
            .context("running indexer command")?;
        anyhow::ensure!(status.success(), "indexer exited with {status}");
        Ok(())
    }
}

/// Indexer that only logs, for deployments where indexing is triggered
/// elsewhere.
pub struct NoopIndexer;

#[async_trait]
impl Indexer for NoopIndexer {
    async fn index(&self, job: &Job) -> Result<()> {
        info!(job_id = %job.id, "no indexer configured, leaving job for external indexing");
        Ok(())
    }
}

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no eligible job exists.
    pub poll_interval: Duration,
    /// Volume whose usage gates admission.
    pub working_volume: PathBuf,
    /// Usage percentage at or above which no new job is selected.
    pub disk_threshold_percent: f64,
    /// Device id of the boot disk; `None` resolves it from `/`.
    pub root_device: Option<u64>,
    pub settings: StrategySettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            working_volume: PathBuf::from("/"),
            disk_threshold_percent: 85.0,
            root_device: None,
            settings: StrategySettings::default(),
        }
    }
}

/// What one poll iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing eligible (empty queue or disk over threshold).
    NoWork,
    /// One job was driven to a post-stage transition.
    Processed(Uuid),
}

/// A running progress monitor and its verdict channel for one stage
/// attempt.
///
/// The run-state document has exactly one writer at any moment: the
/// monitor while it runs, the supervisor (via a strategy) only after
/// [`MonitorHandle::stop`] has returned.
struct MonitorHandle {
    rx: mpsc::Receiver<Verdict>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    fn spawn(
        options: &ToolOptions,
        state_path: &Path,
        log_path: &Path,
        error_baseline: Option<ErrorCounts>,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let cancel = parent.child_token();
        let monitor = ProgressMonitor::new(
            options.clone(),
            state_path.to_path_buf(),
            log_path.to_path_buf(),
            tx,
        )
        .with_error_baseline(error_baseline);
        let task = tokio::spawn(monitor.run(cancel.clone()));
        Self { rx, cancel, task }
    }

    /// Cancel the monitor and wait for the task to finish. A tick that is
    /// already in flight completes first, so once this returns no further
    /// run-state write can come from the monitor.
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// The outer control loop. One job at a time, no job-level parallelism.
pub struct WorkerLoop {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    indexer: Arc<dyn Indexer>,
    tiering: Arc<dyn StorageTiering>,
    gauge: Arc<dyn DiskGauge>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        indexer: Arc<dyn Indexer>,
        tiering: Arc<dyn StorageTiering>,
    ) -> Self {
        Self {
            store,
            runtime,
            indexer,
            tiering,
            gauge: Arc::new(SysinfoDiskGauge),
            config: WorkerConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Substitute the disk gauge (tests).
    pub fn with_gauge(mut self, gauge: Arc<dyn DiskGauge>) -> Self {
        self.gauge = gauge;
        self
    }

    /// Token that requests a graceful stop and interrupts settle waits.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Free-running mode: poll until shutdown. Returns `Ok` on a clean
    /// stop; idle polls are not errors.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            disk_threshold_percent = self.config.disk_threshold_percent,
            "worker loop starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Ok(PollOutcome::Processed(job_id)) => {
                    debug!(job_id = %job_id, "poll iteration processed a job");
                }
                Ok(PollOutcome::NoWork) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    // Unexpected fault: log, then retry on the next tick.
                    error!(error = %e, "poll iteration failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!("worker loop stopped");
        Ok(())
    }

    /// Exactly one poll iteration, for tests and external schedulers that
    /// prefer to drive the loop themselves.
    pub async fn run_once(&self) -> Result<PollOutcome> {
        if !guardrails::headroom_available(
            self.gauge.as_ref(),
            &self.config.working_volume,
            self.config.disk_threshold_percent,
        ) {
            return Ok(PollOutcome::NoWork);
        }

        let cooldown = chrono::Duration::minutes(INFRA_ERROR_COOLDOWN_MINUTES);
        let Some(mut job) = self.store.claim_next(cooldown).await? else {
            return Ok(PollOutcome::NoWork);
        };

        info!(
            job_id = %job.id,
            source = %job.source,
            retry_count = job.retry_count,
            "claimed crawl job"
        );
        // Held for the whole run so admin bulk operations skip this job.
        // The flock wait is a blocking syscall, so take it on the blocking
        // pool instead of parking a runtime worker.
        let lock_target = job.clone();
        let _lock = tokio::task::spawn_blocking(move || super::admin::lock_job(&lock_target))
            .await
            .context("acquiring job lock")??;
        let job_id = job.id;
        self.process_job(&mut job).await?;
        Ok(PollOutcome::Processed(job_id))
    }

    /// Drive one claimed job to its post-stage transition.
    async fn process_job(&self, job: &mut Job) -> Result<()> {
        job.crawler_stage = Some("crawling".to_string());
        self.store.save(job).await?;

        match self.supervise_crawl(job).await {
            Ok(exit) if exit.success() => self.complete_job(job).await,
            Ok(exit) => {
                self.record_ordinary_failure(job, exit.code()).await
            }
            Err(e) => match classify_failure(&e) {
                FailureClass::Infra => {
                    warn!(job_id = %job.id, error = %e, "infra error, re-queueing without charge");
                    job.crawler_status = CrawlerStatus::InfraError;
                    job.crawler_status_at = Some(Utc::now());
                    job.status = JobStatus::Retryable;
                    self.store.save(job).await
                }
                FailureClass::Config => {
                    // Automation-terminal: leave the status untouched and
                    // wait for an operator.
                    error!(job_id = %job.id, error = %e, "configuration error, operator required");
                    job.crawler_status = CrawlerStatus::InfraErrorConfig;
                    job.crawler_status_at = Some(Utc::now());
                    self.store.save(job).await
                }
                FailureClass::Ordinary => {
                    warn!(job_id = %job.id, error = %e, "crawl failed");
                    self.record_ordinary_failure(job, None).await
                }
            },
        }
    }

    async fn complete_job(&self, job: &mut Job) -> Result<()> {
        self.update_progress_counters(job);
        job.status = JobStatus::Completed;
        job.crawler_status = CrawlerStatus::Normal;
        job.crawler_status_at = Some(Utc::now());
        job.crawler_exit_code = Some(0);
        self.store.save(job).await?;

        job.crawler_stage = Some("indexing".to_string());
        self.store.save(job).await?;
        match self.indexer.index(job).await {
            Ok(()) => {
                job.status = JobStatus::Indexed;
                self.store.save(job).await?;
                info!(job_id = %job.id, pages = job.pages_crawled, "job crawled and indexed");
                self.cleanup_run_artifacts(job);
                Ok(())
            }
            Err(e) => {
                // Indexing failures are not retried by this loop.
                error!(job_id = %job.id, error = %e, "indexing failed");
                job.status = JobStatus::IndexFailed;
                self.store.save(job).await
            }
        }
    }

    async fn record_ordinary_failure(&self, job: &mut Job, exit_code: Option<i32>) -> Result<()> {
        self.update_progress_counters(job);
        job.crawler_status = CrawlerStatus::Normal;
        job.crawler_status_at = Some(Utc::now());
        job.crawler_exit_code = exit_code;
        if job.retry_count < MAX_CRAWL_RETRIES {
            job.retry_count += 1;
            job.status = JobStatus::Retryable;
            warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                exit_code = ?exit_code,
                "crawl failed, will retry"
            );
        } else {
            job.status = JobStatus::Failed;
            error!(job_id = %job.id, "crawl failed, retry budget exhausted");
        }
        self.store.save(job).await
    }

    /// Run the crawl stage, restarting it whenever an adaptation requires
    /// a relaunch, until the container exits on its own.
    async fn supervise_crawl(&self, job: &mut Job) -> Result<ExitStatus> {
        guardrails::enforce_offroot_placement(
            job,
            self.tiering.as_ref(),
            self.resolve_root_device()?,
        )
        .await?;

        let options = job.tool_options();
        let output_dir = job.output_path();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating output dir {}", output_dir.display()))?;
        let state_path = run_state_path(&output_dir);

        if job.retry_count > 0 && options.backoff_delay_minutes > 0 {
            debug!(
                job_id = %job.id,
                minutes = options.backoff_delay_minutes,
                "backing off before relaunch"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(options.backoff_delay_minutes * 60)) => {}
            }
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut state = RunState::load(&state_path, options.initial_workers)?;
            let workers = state.current_workers.max(options.min_workers);
            let mut handle = self.runtime.launch(job, workers, attempt).await?;
            if let Some(dir) = &handle.scratch_dir {
                state.register_temp_dir(dir.clone());
            }
            state.save(&state_path)?;

            job.progress_log = Some(handle.progress_log.display().to_string());
            self.store.save(job).await?;

            if !options.enable_monitoring {
                let exit = handle
                    .child
                    .wait()
                    .await
                    .context("waiting for crawl container")?;
                info!(job_id = %job.id, attempt, code = ?exit.code(), "crawl container exited");
                return Ok(exit);
            }

            let mut mon = MonitorHandle::spawn(
                &options,
                &state_path,
                &handle.progress_log,
                None,
                &self.shutdown,
            );
            let restart = loop {
                tokio::select! {
                    exit = handle.child.wait() => {
                        mon.stop().await;
                        break Some(exit.context("waiting for crawl container")?);
                    }
                    verdict = mon.rx.recv() => {
                        let Some(verdict) = verdict else {
                            // Monitor gone (process shutdown); wait the
                            // stage out.
                            break Some(
                                handle
                                    .child
                                    .wait()
                                    .await
                                    .context("waiting for crawl container")?,
                            );
                        };
                        if !verdict.is_actionable() {
                            continue;
                        }
                        warn!(job_id = %job.id, ?verdict, "monitor flagged the stage");
                        // Stop the monitor and wait it out before a
                        // strategy loads its run-state snapshot, so the
                        // document has a single writer across the
                        // adaptation and its settle window.
                        mon.stop().await;
                        let ctx = StrategyContext {
                            job,
                            options: &options,
                            runtime: self.runtime.as_ref(),
                            state_path: &state_path,
                            settings: &self.config.settings,
                            cancel: &self.shutdown,
                        };
                        match apply_adaptations(&ctx).await? {
                            Outcome::Applied { restart_required: true } => {
                                // The strategy already stopped the
                                // container; reap the child and relaunch.
                                let _ = handle.child.wait().await;
                                break None;
                            }
                            outcome => {
                                // Rotation applied in place, not due, or
                                // everything exhausted: the stage runs to
                                // its own natural exit. Re-arm on a fresh
                                // channel; verdicts queued before the
                                // adaptation reflect pre-adaptation
                                // tallies and must not fire again. Seed
                                // the error baseline from the log so the
                                // cumulative tallies are not re-counted.
                                debug!(job_id = %job.id, ?outcome, "stage continues");
                                let baseline = read_latest_status(&handle.progress_log)
                                    .ok()
                                    .flatten()
                                    .map(|event| event.errors);
                                mon = MonitorHandle::spawn(
                                    &options,
                                    &state_path,
                                    &handle.progress_log,
                                    baseline,
                                    &self.shutdown,
                                );
                            }
                        }
                    }
                }
            };

            match restart {
                Some(exit) => {
                    info!(job_id = %job.id, attempt, code = ?exit.code(), "crawl container exited");
                    return Ok(exit);
                }
                None => continue,
            }
        }
    }

    fn resolve_root_device(&self) -> Result<u64> {
        self.config
            .root_device
            .or_else(guardrails::root_device)
            .context("cannot determine root storage device")
    }

    /// Copy the last known progress counters from the attempt's log onto
    /// the job record for API/CLI reporting.
    fn update_progress_counters(&self, job: &mut Job) {
        let Some(log) = job.progress_log.as_deref() else {
            return;
        };
        match read_latest_status(std::path::Path::new(log)) {
            Ok(Some(event)) => {
                job.pages_crawled = event.crawled as i64;
                job.pages_total = event.total as i64;
                job.pages_failed = event.failed as i64;
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "could not read final progress"),
        }
    }

    /// Reclaim the run's temporary state after successful indexing.
    fn cleanup_run_artifacts(&self, job: &Job) {
        let state_path = run_state_path(&job.output_path());
        let state = match RunState::load(&state_path, 1) {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "cleanup: could not load run state");
                return;
            }
        };
        for dir in &state.temp_dirs {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %job.id, dir = %dir.display(), error = %e, "cleanup failed");
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&state_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %job.id, error = %e, "could not remove run state document");
            }
        }
    }
}
