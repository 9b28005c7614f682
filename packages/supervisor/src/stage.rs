//! Container lifecycle for one crawl stage attempt.
//!
//! The supervisor talks to the container runtime only through the
//! [`ContainerRuntime`] trait so the worker loop, strategies, and tests
//! can share a fake. The production implementation shells out to docker
//! and supervises the attached `docker run` process; the child's lifetime
//! is the container's lifetime.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::CrawlError;
use crate::jobs::Job;

/// A launched crawl attempt: the supervised process plus where this
/// attempt writes its progress log.
#[derive(Debug)]
pub struct CrawlHandle {
    pub child: Child,
    pub progress_log: PathBuf,
    /// Scratch directory created for this attempt, if any.
    pub scratch_dir: Option<PathBuf>,
}

/// Seam between the supervisor and the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch one crawl attempt with the given worker count.
    async fn launch(&self, job: &Job, workers: u32, attempt: u32) -> Result<CrawlHandle>;

    /// Stop the job's container. Stopping a container that is already
    /// gone is not an error.
    async fn stop(&self, job: &Job) -> Result<()>;
}

/// Production runtime driving `docker run` / `docker stop`.
pub struct DockerRuntime {
    image: String,
    /// Extra `docker run` arguments (network, resource limits).
    extra_args: Vec<String>,
}

impl DockerRuntime {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn container_name(job: &Job) -> String {
        format!("crawl-{}", job.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, job: &Job, workers: u32, attempt: u32) -> Result<CrawlHandle> {
        let config = job.parse_config()?;
        if config.seed_urls.is_empty() {
            return Err(CrawlError::Config(format!("job {} has no seed urls", job.id)).into());
        }

        let output_dir = job.output_path();
        let log_dir = output_dir.join("logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log dir {}", log_dir.display()))?;
        let scratch_dir = output_dir.join(format!("tmp/attempt-{attempt}"));
        std::fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("creating scratch dir {}", scratch_dir.display()))?;

        let progress_log = log_dir.join(format!(
            "crawl-{}-a{attempt}.log",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        let log_file = std::fs::File::create(&progress_log)
            .with_context(|| format!("creating progress log {}", progress_log.display()))?;
        let err_file = log_file
            .try_clone()
            .context("cloning progress log handle for stderr")?;

        let options = config.tool_options;
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(Self::container_name(job))
            .arg("-v")
            .arg(format!("{}:/crawl", output_dir.display()));
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd.arg(&self.image)
            .arg("--workers")
            .arg(workers.to_string())
            .arg("--log-level")
            .arg(&options.log_level)
            .args(&config.seed_urls)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file))
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| CrawlError::Launch(format!("docker run: {e}")))?;

        info!(
            job_id = %job.id,
            source = %job.source,
            workers,
            attempt,
            log = %progress_log.display(),
            "launched crawl container"
        );

        Ok(CrawlHandle {
            child,
            progress_log,
            scratch_dir: Some(scratch_dir),
        })
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let name = Self::container_name(job);
        let output = Command::new("docker")
            .arg("stop")
            .arg("--time")
            .arg("30")
            .arg(&name)
            .output()
            .await
            .context("running docker stop")?;

        if !output.status.success() {
            // Most commonly the container already exited on its own.
            warn!(
                container = %name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker stop did not succeed"
            );
        }
        Ok(())
    }
}
