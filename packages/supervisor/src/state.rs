//! Persistent per-run state.
//!
//! One `run_state.json` lives in each job's output directory and survives
//! supervisor restarts. It is the single source of truth for the current
//! worker count, adaptation budgets, and last-known progress. The monitor
//! and the adaptation strategies both read-modify-write it, always through
//! an atomic write-temp-then-rename so a concurrent reader (watchdog,
//! dashboards) never observes a partial document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the run-state document within a job's output directory.
pub const RUN_STATE_FILE: &str = "run_state.json";

/// Per-kind error tallies extracted from the crawler's progress log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub timeout: u64,
    pub http: u64,
}

impl ErrorCounts {
    pub fn is_zero(&self) -> bool {
        self.timeout == 0 && self.http == 0
    }
}

/// Durable state for one job run.
///
/// Counters are monotonically non-decreasing within a run; nothing here
/// resets them except an explicit restart of the whole job. Callers clamp
/// `current_workers` to their configured floor; the state itself never
/// does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub current_workers: u32,
    pub worker_reductions_done: u32,
    pub container_restarts_done: u32,
    pub vpn_rotations_done: u32,
    pub last_vpn_rotation: Option<DateTime<Utc>>,
    /// Advances only when the crawled-page count advances, never on
    /// error-threshold triggers.
    pub last_progress: DateTime<Utc>,
    pub last_crawled_count: u64,
    /// `-1` means the crawler could not report a pending count.
    pub last_pending_count: i64,
    pub error_counts: ErrorCounts,
    /// Scratch directories created by the current attempt, reclaimed by
    /// cleanup after successful indexing.
    pub temp_dirs: Vec<PathBuf>,
}

impl RunState {
    /// Fresh state for a run that has not produced any progress yet.
    pub fn new(initial_workers: u32) -> Self {
        Self {
            current_workers: initial_workers,
            worker_reductions_done: 0,
            container_restarts_done: 0,
            vpn_rotations_done: 0,
            last_vpn_rotation: None,
            last_progress: Utc::now(),
            last_crawled_count: 0,
            last_pending_count: -1,
            error_counts: ErrorCounts::default(),
            temp_dirs: Vec::new(),
        }
    }

    /// Load the state document at `path`, or seed a fresh one with
    /// `initial_workers` if none exists yet.
    pub fn load(path: &Path, initial_workers: u32) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(initial_workers));
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading run state {}", path.display()))?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("parsing run state {}", path.display()))?;
        Ok(state)
    }

    /// Durably persist the document.
    ///
    /// Writes to a temp file in the same directory and renames it over the
    /// target, so readers only ever see a complete document.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serializing run state")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .with_context(|| format!("writing run state temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming run state into place at {}", path.display()))?;
        Ok(())
    }

    /// Record a progress observation from the crawler's log.
    ///
    /// `last_progress` moves forward only when the crawled count moved.
    pub fn record_progress(&mut self, crawled: u64, pending: i64, now: DateTime<Utc>) {
        if crawled > self.last_crawled_count {
            self.last_crawled_count = crawled;
            self.last_progress = now;
        }
        self.last_pending_count = pending;
    }

    /// Accumulate freshly observed error deltas.
    pub fn add_errors(&mut self, delta: ErrorCounts) {
        self.error_counts.timeout += delta.timeout;
        self.error_counts.http += delta.http;
    }

    /// Clear the error tallies after a successful adaptation so the same
    /// signal does not immediately re-flag the run.
    pub fn reset_error_counts(&mut self) {
        self.error_counts = ErrorCounts::default();
    }

    /// Track a scratch directory created by the current attempt.
    pub fn register_temp_dir(&mut self, dir: PathBuf) {
        if !self.temp_dirs.contains(&dir) {
            self.temp_dirs.push(dir);
        }
    }
}

/// Path of the run-state document for a job output directory.
pub fn run_state_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RUN_STATE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_load_missing_seeds_initial_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_state_path(dir.path());
        let state = RunState::load(&path, 6).unwrap();
        assert_eq!(state.current_workers, 6);
        assert_eq!(state.vpn_rotations_done, 0);
        assert_eq!(state.last_pending_count, -1);
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = run_state_path(dir.path());

        let mut state = RunState::new(4);
        state.worker_reductions_done = 1;
        state.add_errors(ErrorCounts { timeout: 3, http: 7 });
        state.register_temp_dir(dir.path().join("scratch"));
        state.save(&path).unwrap();

        let loaded = RunState::load(&path, 99).unwrap();
        assert_eq!(loaded.current_workers, 4);
        assert_eq!(loaded.worker_reductions_done, 1);
        assert_eq!(loaded.error_counts, ErrorCounts { timeout: 3, http: 7 });
        assert_eq!(loaded.temp_dirs.len(), 1);
        // No partial temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_record_progress_only_advances_on_new_pages() {
        let mut state = RunState::new(4);
        let t0 = state.last_progress;

        let later = t0 + Duration::minutes(5);
        state.record_progress(10, 90, later);
        assert_eq!(state.last_progress, later);
        assert_eq!(state.last_crawled_count, 10);

        // Same crawled count: timestamp must not move, pending still updates.
        let much_later = t0 + Duration::minutes(20);
        state.record_progress(10, 40, much_later);
        assert_eq!(state.last_progress, later);
        assert_eq!(state.last_pending_count, 40);
    }

    #[test]
    fn test_register_temp_dir_dedupes() {
        let mut state = RunState::new(1);
        state.register_temp_dir(PathBuf::from("/tmp/a"));
        state.register_temp_dir(PathBuf::from("/tmp/a"));
        assert_eq!(state.temp_dirs.len(), 1);
    }
}
