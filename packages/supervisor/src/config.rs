//! Process configuration from the environment.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Environment-driven configuration for the supervisor and watchdog
/// binaries. Job-level behavior (tool options) comes from each job's
/// config blob, not from here.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub database_url: String,
    /// Volume holding crawl output; its usage gates job admission.
    pub working_volume: PathBuf,
    pub disk_threshold_percent: f64,
    pub poll_interval_secs: u64,
    /// Image run for each crawl attempt.
    pub crawler_image: String,
    /// Extra `docker run` arguments.
    pub docker_args: Vec<String>,
    /// Command invoked as `<cmd> <job_id> <output_dir>` after a crawl.
    pub indexer_command: Option<String>,
    /// Command invoked as `<cmd> <source> <output_dir>` to move annual
    /// campaigns off the boot disk.
    pub tiering_command: Option<String>,
    /// Command the watchdog runs after recovering a stale job.
    pub worker_restart_command: Option<String>,
    /// Directory for the watchdog's recovery log.
    pub state_dir: PathBuf,
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let working_volume =
            PathBuf::from(optional("WORKING_VOLUME").unwrap_or_else(|| "/data/crawls".into()));
        let disk_threshold_percent = match optional("DISK_THRESHOLD_PERCENT") {
            Some(raw) => raw
                .parse::<f64>()
                .context("DISK_THRESHOLD_PERCENT must be a number")?,
            None => 85.0,
        };
        let poll_interval_secs = match optional("POLL_INTERVAL_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .context("POLL_INTERVAL_SECS must be an integer")?,
            None => 30,
        };
        let crawler_image =
            optional("CRAWLER_IMAGE").unwrap_or_else(|| "crawler:latest".into());
        let docker_args = optional("CRAWLER_DOCKER_ARGS")
            .map(|raw| raw.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        let state_dir = PathBuf::from(
            optional("SUPERVISOR_STATE_DIR").unwrap_or_else(|| "/var/lib/crawl-supervisor".into()),
        );

        Ok(Self {
            database_url,
            working_volume,
            disk_threshold_percent,
            poll_interval_secs,
            crawler_image,
            docker_args,
            indexer_command: optional("INDEXER_COMMAND"),
            tiering_command: optional("TIERING_COMMAND"),
            worker_restart_command: optional("WORKER_RESTART_COMMAND"),
            state_dir,
        })
    }
}
