//! Progress/stall monitor for one crawl stage attempt.
//!
//! Runs as its own tokio task alongside the crawl subprocess, ticking on a
//! fixed interval. Each tick samples the crawler's structured progress
//! log, folds the observation into the persistent run state, and emits a
//! verdict over a one-way channel to the supervising loop. The monitor
//! never acts on what it sees; corrective action is the supervisor's job.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::jobs::ToolOptions;
use crate::state::{ErrorCounts, RunState};

/// Why the monitor flagged the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    TimeoutThreshold,
    HttpThreshold,
}

/// Verdict for one monitor tick. Ephemeral; consumed exactly once by the
/// supervising loop and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// No forward progress for at least the stall timeout.
    Stalled,
    /// An error tally crossed its configured threshold.
    Error(ErrorReason),
}

impl Verdict {
    /// Whether the supervisor should attempt an adaptation.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Verdict::Ok)
    }
}

/// One `status` event from the crawler's line-oriented progress log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: String,
    pub crawled: u64,
    #[serde(default)]
    pub total: u64,
    /// `-1` when the crawler cannot report a pending count.
    #[serde(default = "unknown_pending")]
    pub pending: i64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub errors: ErrorCounts,
}

fn unknown_pending() -> i64 {
    -1
}

/// Read the newest `status` event from a progress log.
///
/// A missing log is not an error: early in a stage the crawler may not
/// have written anything yet.
pub fn read_latest_status(path: &std::path::Path) -> Result<Option<ProgressEvent>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading progress log {}", path.display()))?;
    for line in raw.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ProgressEvent>(line) {
            Ok(event) if event.event == "status" => return Ok(Some(event)),
            // Crawlers interleave other event kinds and the final line can
            // be a partial write; keep scanning backwards.
            _ => continue,
        }
    }
    Ok(None)
}

/// Fold one observation into the run state and decide a verdict.
///
/// `prev_errors` is the monitor's in-memory baseline for computing error
/// deltas from the log's cumulative tallies; it does not survive a stage
/// restart, which is fine because a fresh attempt writes a fresh log.
pub fn evaluate(
    state: &mut RunState,
    event: Option<&ProgressEvent>,
    prev_errors: &mut Option<ErrorCounts>,
    options: &ToolOptions,
    now: DateTime<Utc>,
) -> Verdict {
    if let Some(event) = event {
        let baseline = prev_errors.unwrap_or_default();
        let delta = ErrorCounts {
            timeout: event.errors.timeout.saturating_sub(baseline.timeout),
            http: event.errors.http.saturating_sub(baseline.http),
        };
        state.add_errors(delta);
        *prev_errors = Some(event.errors);
        state.record_progress(event.crawled, event.pending, now);
    }

    let idle = now - state.last_progress;
    let stall_after = Duration::minutes(options.stall_timeout_minutes as i64);
    // A pending count of zero means the crawl is draining to completion;
    // anything else, including the unknown marker `-1`, cannot confirm
    // completion and stall detection fires purely on age.
    if idle >= stall_after && state.last_pending_count != 0 {
        return Verdict::Stalled;
    }

    // Threshold breaches deliberately leave `last_progress` untouched: a
    // noisy job with no forward progress stays non-progressing.
    if options.error_threshold_timeout > 0
        && state.error_counts.timeout >= options.error_threshold_timeout
    {
        return Verdict::Error(ErrorReason::TimeoutThreshold);
    }
    if options.error_threshold_http > 0 && state.error_counts.http >= options.error_threshold_http {
        return Verdict::Error(ErrorReason::HttpThreshold);
    }

    Verdict::Ok
}

/// Periodic monitor for one stage attempt.
pub struct ProgressMonitor {
    options: ToolOptions,
    state_path: PathBuf,
    log_path: PathBuf,
    prev_errors: Option<ErrorCounts>,
    tx: mpsc::Sender<Verdict>,
}

impl ProgressMonitor {
    pub fn new(
        options: ToolOptions,
        state_path: PathBuf,
        log_path: PathBuf,
        tx: mpsc::Sender<Verdict>,
    ) -> Self {
        Self {
            options,
            state_path,
            log_path,
            prev_errors: None,
            tx,
        }
    }

    /// Seed the error-delta baseline. Used when a monitor is re-armed
    /// over a log that already carries cumulative tallies, so they are
    /// not counted a second time.
    pub fn with_error_baseline(mut self, baseline: Option<ErrorCounts>) -> Self {
        self.prev_errors = baseline;
        self
    }

    /// Sample the log once, persist the updated run state, and return the
    /// verdict.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Verdict> {
        let mut state = RunState::load(&self.state_path, self.options.initial_workers)?;
        let event = read_latest_status(&self.log_path)?;
        let verdict = evaluate(
            &mut state,
            event.as_ref(),
            &mut self.prev_errors,
            &self.options,
            now,
        );
        state.save(&self.state_path)?;
        Ok(verdict)
    }

    /// Tick until cancelled or the receiver goes away.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = std::time::Duration::from_secs(self.options.monitor_interval_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now()) {
                        Ok(verdict) => {
                            debug!(
                                log = %self.log_path.display(),
                                ?verdict,
                                "monitor tick"
                            );
                            if self.tx.send(verdict).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // A torn read or a slow mount is not fatal for
                            // the monitor; try again next tick.
                            warn!(error = %e, "monitor tick failed");
                        }
                    }
                }
            }
        }
    }
}
