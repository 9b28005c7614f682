//! Admission guardrails consulted before and during job selection.
//!
//! Two checks gate whether a job may start at all: disk headroom on the
//! working volume (fail open: a stat failure must not park the whole
//! queue) and storage-tier placement for annual campaign jobs (fail safe:
//! an undeterminable device counts as the root device and blocks launch).

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sysinfo::Disks;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::jobs::Job;

/// Guardrail violations that abort a launch.
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("annual job {0}: output directory still resolves to the root storage device")]
    RootDevice(Uuid),
}

/// Filesystem usage source, injectable for tests.
pub trait DiskGauge: Send + Sync {
    /// Usage percentage of the filesystem holding `path`, or `None` if it
    /// cannot be determined.
    fn usage_percent(&self, path: &Path) -> Option<f64>;
}

/// Gauge backed by the host's mounted-disk list.
pub struct SysinfoDiskGauge;

impl DiskGauge for SysinfoDiskGauge {
    fn usage_percent(&self, path: &Path) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        // The disk with the longest mount-point prefix is the one that
        // actually holds the path.
        let disk = disks
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(disk.available_space());
        Some(used as f64 / total as f64 * 100.0)
    }
}

/// Whether the working volume has headroom for another crawl.
///
/// At or above the threshold the poll is treated as "no work found";
/// queued jobs simply stay queued. A gauge failure reports headroom as
/// available, since blocking all work on a transient stat error is worse
/// than proceeding.
pub fn headroom_available(gauge: &dyn DiskGauge, path: &Path, threshold_percent: f64) -> bool {
    match gauge.usage_percent(path) {
        Some(usage) if usage >= threshold_percent => {
            info!(
                path = %path.display(),
                usage_percent = format!("{usage:.1}"),
                threshold_percent,
                "working volume over disk threshold, deferring job selection"
            );
            false
        }
        Some(_) => true,
        None => {
            warn!(
                path = %path.display(),
                "could not determine filesystem usage, assuming headroom"
            );
            true
        }
    }
}

/// External step that relocates a job's output directory to bulk storage.
#[async_trait]
pub trait StorageTiering: Send + Sync {
    async fn relocate(&self, job: &Job) -> Result<()>;
}

/// Tiering backed by an operator-provided command, invoked as
/// `<command> <source> <output_dir>`.
pub struct CommandTiering {
    command: String,
}

impl CommandTiering {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl StorageTiering for CommandTiering {
    async fn relocate(&self, job: &Job) -> Result<()> {
        let status = tokio::process::Command::new(&self.command)
            .arg(&job.source)
            .arg(&job.output_dir)
            .status()
            .await?;
        anyhow::ensure!(status.success(), "tiering command exited with {status}");
        Ok(())
    }
}

/// Tiering step that does nothing, for deployments without bulk storage.
pub struct NoopTiering;

#[async_trait]
impl StorageTiering for NoopTiering {
    async fn relocate(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

/// Device id holding `path`, if it can be determined.
#[cfg(unix)]
pub fn device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.dev())
}

/// Device id of the root filesystem.
pub fn root_device() -> Option<u64> {
    device_of(Path::new("/"))
}

/// Ensure an annual campaign job is not placed on the root storage
/// device, invoking the tiering step once if it still is.
///
/// Non-annual jobs pass trivially. An undeterminable device is treated as
/// the root device: large recurring crawls must never be allowed to eat
/// the boot disk by accident.
pub async fn enforce_offroot_placement(
    job: &Job,
    tiering: &dyn StorageTiering,
    root_device: u64,
) -> Result<()> {
    if !job.annual {
        return Ok(());
    }

    let on_root = |dev: Option<u64>| dev.map_or(true, |d| d == root_device);

    if !on_root(device_of(&job.output_path())) {
        return Ok(());
    }

    info!(
        job_id = %job.id,
        output_dir = %job.output_dir,
        "annual job output on root device, invoking tiering step"
    );
    tiering.relocate(job).await?;

    if on_root(device_of(&job.output_path())) {
        return Err(GuardrailError::RootDevice(job.id).into());
    }
    Ok(())
}
