//! Crawl job model.
//!
//! The job row is owned by the shared store (schema and migrations live
//! with the API layer); the supervisor owns status transitions while a job
//! is in flight and hands ownership to indexing once the crawl reaches a
//! terminal state.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of a crawl job.
///
/// `queued → running → {completed, failed}`; `retryable → running`;
/// `completed → indexed | index_failed`; the watchdog may push any
/// non-terminal job back to `retryable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "crawl_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Retryable,
    Completed,
    Failed,
    Indexed,
    IndexFailed,
}

/// How the last crawl attempt ended, beyond the plain exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "crawler_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrawlerStatus {
    #[default]
    Normal,
    /// Transient storage/mount fault; re-selected after a cooldown and
    /// never charged against the retry budget.
    InfraError,
    /// Configuration fault; automation leaves the job for an operator.
    InfraErrorConfig,
}

/// Self-healing and concurrency policy, carried in the job's config blob.
///
/// Every field has a serde default so partial configs from the API layer
/// deserialize cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOptions {
    pub enable_monitoring: bool,
    pub monitor_interval_seconds: u64,
    pub stall_timeout_minutes: u64,

    pub error_threshold_timeout: u64,
    pub error_threshold_http: u64,

    pub enable_adaptive_workers: bool,
    pub min_workers: u32,
    pub max_worker_reductions: i64,

    pub enable_adaptive_restart: bool,
    pub max_container_restarts: i64,

    pub enable_vpn_rotation: bool,
    pub vpn_connect_command: String,
    pub max_vpn_rotations: i64,
    pub vpn_rotation_frequency_minutes: u64,

    pub initial_workers: u32,
    pub backoff_delay_minutes: u64,
    pub log_level: String,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            enable_monitoring: false,
            monitor_interval_seconds: 60,
            stall_timeout_minutes: 30,
            error_threshold_timeout: 50,
            error_threshold_http: 100,
            enable_adaptive_workers: false,
            min_workers: 1,
            max_worker_reductions: 2,
            enable_adaptive_restart: false,
            max_container_restarts: 2,
            enable_vpn_rotation: false,
            vpn_connect_command: String::new(),
            max_vpn_rotations: 3,
            vpn_rotation_frequency_minutes: 60,
            initial_workers: 4,
            backoff_delay_minutes: 0,
            log_level: "info".to_string(),
        }
    }
}

/// Structured job configuration: what to crawl plus the tool options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub seed_urls: Vec<String>,
    pub tool_options: ToolOptions,
}

/// A crawl job record.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    /// Source identifier (domain or campaign name).
    pub source: String,
    /// Output directory for archives, logs, and the run-state document.
    pub output_dir: String,

    pub status: JobStatus,
    pub retry_count: i32,

    pub crawler_exit_code: Option<i32>,
    pub crawler_status: CrawlerStatus,
    /// When `crawler_status` was last set; drives the infra-error cooldown.
    pub crawler_status_at: Option<DateTime<Utc>>,
    /// Free-text label of the last stage attempted.
    pub crawler_stage: Option<String>,

    pub pages_crawled: i64,
    pub pages_total: i64,
    pub pages_failed: i64,

    /// Large recurring campaign subject to storage-tier placement.
    pub annual: bool,

    /// Progress log of the most recent attempt. Informational; recovery
    /// tooling scans the log directory rather than trusting this pointer.
    pub progress_log: Option<String>,

    /// Seed URLs and tool options (see [`JobConfig`]).
    pub config: serde_json::Value,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job (used by tests and admin tooling; the
    /// API layer normally inserts jobs).
    pub fn queued(source: &str, output_dir: &str, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            output_dir: output_dir.to_string(),
            status: JobStatus::Queued,
            retry_count: 0,
            crawler_exit_code: None,
            crawler_status: CrawlerStatus::Normal,
            crawler_status_at: None,
            crawler_stage: None,
            pages_crawled: 0,
            pages_total: 0,
            pages_failed: 0,
            annual: false,
            progress_log: None,
            config: serde_json::to_value(config).unwrap_or(serde_json::Value::Null),
            queued_at: now,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deserialize the config blob.
    pub fn parse_config(&self) -> Result<JobConfig> {
        serde_json::from_value(self.config.clone())
            .with_context(|| format!("parsing config for job {}", self.id))
    }

    /// Tool options from the config blob, falling back to defaults when
    /// the blob is absent or partial.
    pub fn tool_options(&self) -> ToolOptions {
        self.parse_config()
            .map(|c| c.tool_options)
            .unwrap_or_default()
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    /// Whether the job is eligible for selection given the infra-error
    /// cooldown window.
    pub fn selectable(&self, now: DateTime<Utc>, infra_cooldown: chrono::Duration) -> bool {
        if !matches!(self.status, JobStatus::Queued | JobStatus::Retryable) {
            return false;
        }
        if self.crawler_status == CrawlerStatus::InfraError {
            match self.crawler_status_at {
                Some(at) => now - at >= infra_cooldown,
                // No timestamp to gate on; do not hold the job forever.
                None => true,
            }
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_tool_options_defaults_from_empty_config() {
        let job = Job::queued("example.org", "/data/example", JobConfig::default());
        let opts = job.tool_options();
        assert!(!opts.enable_monitoring);
        assert_eq!(opts.initial_workers, 4);
        assert_eq!(opts.min_workers, 1);
    }

    #[test]
    fn test_partial_config_blob_fills_defaults() {
        let mut job = Job::queued("example.org", "/data/example", JobConfig::default());
        job.config = serde_json::json!({
            "seed_urls": ["https://example.org"],
            "tool_options": { "enable_monitoring": true, "stall_timeout_minutes": 5 }
        });
        let config = job.parse_config().unwrap();
        assert!(config.tool_options.enable_monitoring);
        assert_eq!(config.tool_options.stall_timeout_minutes, 5);
        assert_eq!(config.tool_options.error_threshold_http, 100);
    }

    #[test]
    fn test_infra_error_cooldown_gates_selection() {
        let now = Utc::now();
        let mut job = Job::queued("example.org", "/data/example", JobConfig::default());
        job.status = JobStatus::Retryable;
        job.crawler_status = CrawlerStatus::InfraError;
        job.crawler_status_at = Some(now - Duration::minutes(5));

        let cooldown = Duration::minutes(30);
        assert!(!job.selectable(now, cooldown));

        job.crawler_status_at = Some(now - Duration::minutes(31));
        assert!(job.selectable(now, cooldown));
    }

    #[test]
    fn test_running_job_is_not_selectable() {
        let mut job = Job::queued("example.org", "/data/example", JobConfig::default());
        job.status = JobStatus::Running;
        assert!(!job.selectable(Utc::now(), Duration::minutes(30)));
    }
}
