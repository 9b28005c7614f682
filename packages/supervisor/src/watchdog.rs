//! Stale-job recovery.
//!
//! An out-of-process auditor, invoked periodically (cron or a systemd
//! timer), that finds jobs stuck in `running` — typically after a
//! supervisor crash — and returns them to the queue. Recoveries are
//! rate-limited per job per rolling day so a wedged job cannot produce a
//! restart loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::jobs::{CrawlerStatus, Job, JobStore};
use crate::monitor::read_latest_status;
use crate::state::{run_state_path, RunState};

/// Stage label stamped on recovered jobs.
pub const RECOVERED_STALE_STAGE: &str = "recovered_stale_running";

/// Why a running job was considered stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// `started_at` exceeds the configured age threshold.
    RunningTooLong,
    /// The newest progress log shows no crawled-count change beyond the
    /// stall threshold.
    NoLogProgress,
}

/// One audited job, for reporting.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub job_id: Uuid,
    pub source: String,
    pub reason: StaleReason,
    /// False on a dry run or when the daily budget was exhausted.
    pub applied: bool,
    pub rate_limited: bool,
}

/// Hook to bounce the worker process after a recovery (systemd unit,
/// supervisor script). Optional.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn restart_worker(&self) -> Result<()>;
}

/// Worker control via an operator-provided command.
pub struct CommandWorkerControl {
    command: String,
}

impl CommandWorkerControl {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl WorkerControl for CommandWorkerControl {
    async fn restart_worker(&self) -> Result<()> {
        let status = tokio::process::Command::new(&self.command)
            .status()
            .await
            .context("running worker restart command")?;
        anyhow::ensure!(status.success(), "worker restart command exited with {status}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Age threshold for `running` jobs.
    pub max_running_age: Duration,
    /// How long the progress log may show no crawled-count change.
    pub stall_threshold: Duration,
    /// Max recoveries per job per rolling 24 h window.
    pub max_recoveries_per_day: usize,
    /// Where the recovery log document lives.
    pub state_dir: PathBuf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_running_age: Duration::hours(12),
            stall_threshold: Duration::minutes(90),
            max_recoveries_per_day: 3,
            state_dir: PathBuf::from("/var/lib/crawl-supervisor"),
        }
    }
}

/// Durable record of recovery timestamps, for the per-day budget.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RecoveryLog {
    recoveries: HashMap<Uuid, Vec<DateTime<Utc>>>,
}

impl RecoveryLog {
    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("recoveries.json")
    }

    fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::path(state_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading recovery log {}", path.display()))?;
        serde_json::from_str(&raw).context("parsing recovery log")
    }

    fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        let path = Self::path(state_dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Recoveries for this job within the rolling day window.
    fn recent(&self, job_id: Uuid, now: DateTime<Utc>) -> usize {
        self.recoveries
            .get(&job_id)
            .map(|ts| ts.iter().filter(|t| now - **t < Duration::hours(24)).count())
            .unwrap_or(0)
    }

    fn record(&mut self, job_id: Uuid, now: DateTime<Utc>) {
        let entry = self.recoveries.entry(job_id).or_default();
        entry.push(now);
        entry.retain(|t| now - *t < Duration::hours(24));
    }
}

/// The stale-job auditor.
pub struct Watchdog {
    store: Arc<dyn JobStore>,
    control: Option<Arc<dyn WorkerControl>>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(store: Arc<dyn JobStore>, config: WatchdogConfig) -> Self {
        Self {
            store,
            control: None,
            config,
        }
    }

    pub fn with_worker_control(mut self, control: Arc<dyn WorkerControl>) -> Self {
        self.control = Some(control);
        self
    }

    /// One audit pass. Dry run (`apply == false`) reports without
    /// mutating anything.
    pub async fn run_once(&self, apply: bool) -> Result<Vec<RecoveryReport>> {
        let now = Utc::now();
        let running = self.store.list_running().await?;
        let mut log = RecoveryLog::load(&self.config.state_dir)?;
        let mut reports = Vec::new();
        let mut restart_worker = false;

        for job in &running {
            // Config-fault jobs belong to an operator, not to automation.
            if job.crawler_status == CrawlerStatus::InfraErrorConfig {
                continue;
            }
            let Some(reason) = self.stale_reason(job, now) else {
                continue;
            };

            let rate_limited = log.recent(job.id, now) >= self.config.max_recoveries_per_day;
            let mut applied = false;
            if apply && !rate_limited {
                self.store.mark_retryable(job.id, RECOVERED_STALE_STAGE).await?;
                log.record(job.id, now);
                applied = true;
                restart_worker = true;
                info!(job_id = %job.id, source = %job.source, ?reason, "recovered stale job");
            } else if rate_limited {
                warn!(
                    job_id = %job.id,
                    max_per_day = self.config.max_recoveries_per_day,
                    "stale job hit the daily recovery budget, leaving it alone"
                );
            } else {
                info!(job_id = %job.id, source = %job.source, ?reason, "stale job (dry run)");
            }

            reports.push(RecoveryReport {
                job_id: job.id,
                source: job.source.clone(),
                reason,
                applied,
                rate_limited,
            });
        }

        if apply && !reports.is_empty() {
            log.save(&self.config.state_dir)?;
        }
        if restart_worker {
            if let Some(control) = &self.control {
                if let Err(e) = control.restart_worker().await {
                    warn!(error = %e, "worker restart after recovery failed");
                }
            }
        }
        Ok(reports)
    }

    /// Decide whether a running job is stuck.
    fn stale_reason(&self, job: &Job, now: DateTime<Utc>) -> Option<StaleReason> {
        if let Some(started) = job.started_at {
            if now - started >= self.config.max_running_age {
                return Some(StaleReason::RunningTooLong);
            }
        }

        // A crash can leave the job's recorded log pointer referencing an
        // earlier attempt, so scan for the newest log by mtime instead.
        let log_path = newest_log_by_mtime(&job.output_path().join("logs"))?;
        let event = read_latest_status(&log_path).ok().flatten();

        let state_path = run_state_path(&job.output_path());
        let state = state_path
            .exists()
            .then(|| RunState::load(&state_path, 1).ok())
            .flatten();

        match (event, state) {
            (Some(event), Some(state)) => {
                if event.crawled <= state.last_crawled_count
                    && now - state.last_progress >= self.config.stall_threshold
                {
                    return Some(StaleReason::NoLogProgress);
                }
            }
            _ => {
                // No parseable status event (a crash right after launch
                // leaves an empty log) or no run state to compare against;
                // fall back to the log's own modification time.
                let modified: DateTime<Utc> =
                    std::fs::metadata(&log_path).ok()?.modified().ok()?.into();
                if now - modified >= self.config.stall_threshold {
                    return Some(StaleReason::NoLogProgress);
                }
            }
        }
        None
    }
}

/// Newest `.log` file in a directory by modification time.
fn newest_log_by_mtime(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::InMemoryJobStore;
    use crate::jobs::{JobConfig, JobStatus};

    fn running_job(output_dir: &Path, started_hours_ago: i64) -> Job {
        let mut job = Job::queued(
            "stale.example.org",
            output_dir.to_str().unwrap(),
            JobConfig::default(),
        );
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now() - Duration::hours(started_hours_ago));
        job
    }

    fn watchdog(store: Arc<InMemoryJobStore>, state_dir: &Path) -> Watchdog {
        Watchdog::new(
            store,
            WatchdogConfig {
                max_running_age: Duration::hours(12),
                stall_threshold: Duration::minutes(90),
                max_recoveries_per_day: 2,
                state_dir: state_dir.to_path_buf(),
            },
        )
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let job = running_job(&dir.path().join("out"), 24);
        let job_id = job.id;
        store.insert(job);

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        let reports = wd.run_once(false).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, StaleReason::RunningTooLong);
        assert!(!reports[0].applied);
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_apply_recovers_with_stage_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let job = running_job(&dir.path().join("out"), 24);
        let job_id = job.id;
        store.insert(job);

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        let reports = wd.run_once(true).await.unwrap();
        assert!(reports[0].applied);

        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Retryable);
        assert_eq!(job.crawler_stage.as_deref(), Some(RECOVERED_STALE_STAGE));
    }

    #[tokio::test]
    async fn test_recovery_budget_per_rolling_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let job = running_job(&dir.path().join("out"), 24);
        let job_id = job.id;
        store.insert(job.clone());

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        for _ in 0..2 {
            let reports = wd.run_once(true).await.unwrap();
            assert!(reports[0].applied);
            // Simulate the job getting stuck in running again.
            let mut stuck = store.get(job_id).unwrap();
            stuck.status = JobStatus::Running;
            stuck.started_at = Some(Utc::now() - Duration::hours(24));
            store.insert(stuck);
        }

        let reports = wd.run_once(true).await.unwrap();
        assert!(reports[0].rate_limited);
        assert!(!reports[0].applied);
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_fresh_running_job_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        store.insert(running_job(&dir.path().join("out"), 1));

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        let reports = wd.run_once(true).await.unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_config_fault_jobs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let mut job = running_job(&dir.path().join("out"), 24);
        job.crawler_status = CrawlerStatus::InfraErrorConfig;
        store.insert(job);

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        let reports = wd.run_once(true).await.unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_log_without_status_events_falls_back_to_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let logs = out.join("logs");
        std::fs::create_dir_all(&logs).unwrap();

        // Crash right after launch: the log exists but carries no status
        // event yet, and no run state was written.
        let log = logs.join("crawl-a1.log");
        std::fs::write(&log, r#"{"event":"start","seed":"https://example.org"}"#).unwrap();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3 * 3600);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&log)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let store = Arc::new(InMemoryJobStore::new());
        // Recently started, so only the log-stall path can flag it.
        let job = running_job(&out, 2);
        store.insert(job);

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        let reports = wd.run_once(false).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, StaleReason::NoLogProgress);
    }

    #[tokio::test]
    async fn test_stalled_log_detected_via_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let logs = out.join("logs");
        std::fs::create_dir_all(&logs).unwrap();

        // Older attempt made progress; the newest log is the one that
        // counts, and it shows the same crawled count as the run state.
        std::fs::write(
            logs.join("crawl-a1.log"),
            r#"{"event":"status","crawled":500,"total":1000,"pending":500,"failed":0}"#,
        )
        .unwrap();
        // Keep the mtimes strictly ordered.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(
            logs.join("crawl-a2.log"),
            r#"{"event":"status","crawled":120,"total":1000,"pending":880,"failed":0}"#,
        )
        .unwrap();

        let mut state = RunState::new(4);
        state.last_crawled_count = 120;
        state.last_progress = Utc::now() - Duration::hours(3);
        state.save(&run_state_path(&out)).unwrap();

        let store = Arc::new(InMemoryJobStore::new());
        // Recently started, so only the log-stall path can flag it.
        let job = running_job(&out, 2);
        store.insert(job);

        let wd = watchdog(store.clone(), &dir.path().join("state"));
        let reports = wd.run_once(false).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, StaleReason::NoLogProgress);
    }
}
