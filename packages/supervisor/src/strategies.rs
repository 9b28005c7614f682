//! Bounded self-healing strategies.
//!
//! All three share a shape: enable flag, budget check (`done < max`, a
//! non-positive max disables the strategy outright), strategy-specific
//! precondition, action, then commit: bump the budget counter, reset the
//! error tallies, and durably save the run state. A failed precondition is
//! a no-op reported as [`Outcome::Skipped`]; strategies never raise on it,
//! so the caller can fall through to the next strategy or give up
//! gracefully.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::jobs::{Job, ToolOptions};
use crate::stage::ContainerRuntime;
use crate::state::RunState;

/// Result of one strategy invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The action was taken and committed to the run state.
    Applied {
        /// Whether the outer loop must relaunch the stage.
        restart_required: bool,
    },
    /// Rotation frequency gate: not a failure, simply not yet due.
    NotDue,
    /// A precondition failed; nothing was mutated.
    Skipped(&'static str),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }
}

/// Fixed delays around container stops and VPN reconnects, overridable in
/// tests.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    /// Pause after stopping a container so the runtime fully releases
    /// resources before a relaunch.
    pub container_settle: Duration,
    /// Pause after a successful VPN reconnect before traffic resumes.
    pub vpn_settle: Duration,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            container_settle: Duration::from_secs(10),
            vpn_settle: Duration::from_secs(30),
        }
    }
}

/// Everything a strategy needs to act on one job.
pub struct StrategyContext<'a> {
    pub job: &'a Job,
    pub options: &'a ToolOptions,
    pub runtime: &'a dyn ContainerRuntime,
    pub state_path: &'a Path,
    pub settings: &'a StrategySettings,
    /// Cooperative cancellation for settle waits; an interrupted wait
    /// must not commit state.
    pub cancel: &'a CancellationToken,
}

impl StrategyContext<'_> {
    fn load_state(&self) -> Result<RunState> {
        RunState::load(self.state_path, self.options.initial_workers)
    }
}

fn budget_left(done: u32, max: i64) -> bool {
    max > 0 && (done as i64) < max
}

/// Drop the worker count by one to relieve resource pressure.
///
/// Stops the container; the outer loop must relaunch the stage with the
/// reduced count.
pub async fn reduce_workers(ctx: &StrategyContext<'_>) -> Result<Outcome> {
    if !(ctx.options.enable_monitoring && ctx.options.enable_adaptive_workers) {
        return Ok(Outcome::Skipped("adaptive workers disabled"));
    }

    let mut state = ctx.load_state()?;
    if !budget_left(state.worker_reductions_done, ctx.options.max_worker_reductions) {
        return Ok(Outcome::Skipped("worker reduction budget exhausted"));
    }
    if state.current_workers <= ctx.options.min_workers {
        return Ok(Outcome::Skipped("already at worker floor"));
    }

    ctx.runtime
        .stop(ctx.job)
        .await
        .context("stopping container for worker reduction")?;
    tokio::time::sleep(ctx.settings.container_settle).await;

    state.current_workers = ctx
        .options
        .min_workers
        .max(state.current_workers.saturating_sub(1));
    state.worker_reductions_done += 1;
    state.reset_error_counts();
    state.save(ctx.state_path)?;

    info!(
        job_id = %ctx.job.id,
        workers = state.current_workers,
        reductions_done = state.worker_reductions_done,
        "reduced crawl workers"
    );
    Ok(Outcome::Applied {
        restart_required: true,
    })
}

/// Plain container restart, with no worker-count change.
pub async fn restart_container(ctx: &StrategyContext<'_>) -> Result<Outcome> {
    if !ctx.options.enable_adaptive_restart {
        return Ok(Outcome::Skipped("adaptive restart disabled"));
    }

    let mut state = ctx.load_state()?;
    if !budget_left(state.container_restarts_done, ctx.options.max_container_restarts) {
        return Ok(Outcome::Skipped("container restart budget exhausted"));
    }

    ctx.runtime
        .stop(ctx.job)
        .await
        .context("stopping container for restart")?;
    tokio::time::sleep(ctx.settings.container_settle).await;

    state.container_restarts_done += 1;
    state.reset_error_counts();
    state.save(ctx.state_path)?;

    info!(
        job_id = %ctx.job.id,
        restarts_done = state.container_restarts_done,
        "restarted crawl container"
    );
    Ok(Outcome::Applied {
        restart_required: true,
    })
}

/// Rotate the VPN exit IP. The only strategy that leaves the subprocess
/// running.
pub async fn rotate_vpn(ctx: &StrategyContext<'_>) -> Result<Outcome> {
    if !(ctx.options.enable_monitoring && ctx.options.enable_vpn_rotation) {
        return Ok(Outcome::Skipped("vpn rotation disabled"));
    }

    let mut state = ctx.load_state()?;
    if !budget_left(state.vpn_rotations_done, ctx.options.max_vpn_rotations) {
        return Ok(Outcome::Skipped("vpn rotation budget exhausted"));
    }

    let mut parts = ctx.options.vpn_connect_command.split_whitespace();
    let Some(program) = parts.next() else {
        return Ok(Outcome::Skipped("no vpn connect command configured"));
    };
    if which::which(program).is_err() {
        return Ok(Outcome::Skipped("vpn connect command not on PATH"));
    }

    // Frequency gate: rotating the exit IP too often churns every worker's
    // open connections for nothing.
    if let Some(last) = state.last_vpn_rotation {
        let min_gap =
            chrono::Duration::minutes(ctx.options.vpn_rotation_frequency_minutes as i64);
        if Utc::now() - last < min_gap {
            return Ok(Outcome::NotDue);
        }
    }

    let status = tokio::process::Command::new(program)
        .args(parts)
        .status()
        .await
        .context("running vpn connect command")?;
    if !status.success() {
        warn!(
            job_id = %ctx.job.id,
            code = ?status.code(),
            "vpn connect command failed"
        );
        return Ok(Outcome::Skipped("vpn connect command failed"));
    }

    // The rotation only counts if the post-reconnect settle completes; a
    // cancelled wait commits nothing.
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            return Ok(Outcome::Skipped("cancelled during vpn settle"));
        }
        _ = tokio::time::sleep(ctx.settings.vpn_settle) => {}
    }

    state.vpn_rotations_done += 1;
    state.last_vpn_rotation = Some(Utc::now());
    state.reset_error_counts();
    state.save(ctx.state_path)?;

    info!(
        job_id = %ctx.job.id,
        rotations_done = state.vpn_rotations_done,
        "rotated vpn exit"
    );
    Ok(Outcome::Applied {
        restart_required: false,
    })
}

/// Try the strategies in their conventional order: worker reduction,
/// container restart, VPN rotation. The first applied action wins; a
/// rotation that is merely not due yet is reported as such so the caller
/// does not treat it as exhaustion.
pub async fn apply_adaptations(ctx: &StrategyContext<'_>) -> Result<Outcome> {
    let outcome = reduce_workers(ctx).await?;
    if outcome.is_applied() {
        return Ok(outcome);
    }

    let outcome = restart_container(ctx).await?;
    if outcome.is_applied() {
        return Ok(outcome);
    }

    let outcome = rotate_vpn(ctx).await?;
    if outcome.is_applied() || outcome == Outcome::NotDue {
        return Ok(outcome);
    }

    Ok(Outcome::Skipped("all strategies inapplicable or exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobConfig};
    use crate::stage::CrawlHandle;
    use crate::state::{run_state_path, ErrorCounts};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime fake that records stop calls and never launches anything.
    #[derive(Default)]
    struct RecordingRuntime {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn launch(&self, _job: &Job, _workers: u32, _attempt: u32) -> Result<CrawlHandle> {
            anyhow::bail!("not used in strategy tests")
        }

        async fn stop(&self, _job: &Job) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_settings() -> StrategySettings {
        StrategySettings {
            container_settle: Duration::from_millis(1),
            vpn_settle: Duration::from_millis(20),
        }
    }

    fn job_with_options(options: ToolOptions, output_dir: &Path) -> Job {
        let config = JobConfig {
            seed_urls: vec!["https://example.org".to_string()],
            tool_options: options,
        };
        Job::queued("example.org", output_dir.to_str().unwrap(), config)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        job: Job,
        options: ToolOptions,
        runtime: RecordingRuntime,
        state_path: std::path::PathBuf,
        settings: StrategySettings,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(options: ToolOptions) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state_path = run_state_path(dir.path());
            let job = job_with_options(options.clone(), dir.path());
            Self {
                _dir: dir,
                job,
                options,
                runtime: RecordingRuntime::default(),
                state_path,
                settings: fast_settings(),
                cancel: CancellationToken::new(),
            }
        }

        fn ctx(&self) -> StrategyContext<'_> {
            StrategyContext {
                job: &self.job,
                options: &self.options,
                runtime: &self.runtime,
                state_path: &self.state_path,
                settings: &self.settings,
                cancel: &self.cancel,
            }
        }

        fn state(&self) -> RunState {
            RunState::load(&self.state_path, self.options.initial_workers).unwrap()
        }
    }

    fn monitored() -> ToolOptions {
        ToolOptions {
            enable_monitoring: true,
            ..ToolOptions::default()
        }
    }

    #[tokio::test]
    async fn test_reduce_workers_respects_floor() {
        let options = ToolOptions {
            enable_adaptive_workers: true,
            initial_workers: 2,
            min_workers: 2,
            max_worker_reductions: 5,
            ..monitored()
        };
        let fx = Fixture::new(options);

        let outcome = reduce_workers(&fx.ctx()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped("already at worker floor"));
        assert_eq!(fx.runtime.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reduce_workers_budget_and_commit() {
        let options = ToolOptions {
            enable_adaptive_workers: true,
            initial_workers: 3,
            min_workers: 1,
            max_worker_reductions: 1,
            ..monitored()
        };
        let fx = Fixture::new(options);

        // Seed error tallies to verify the post-adaptation reset.
        let mut state = fx.state();
        state.add_errors(ErrorCounts { timeout: 9, http: 2 });
        state.save(&fx.state_path).unwrap();

        let outcome = reduce_workers(&fx.ctx()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                restart_required: true
            }
        );
        let state = fx.state();
        assert_eq!(state.current_workers, 2);
        assert_eq!(state.worker_reductions_done, 1);
        assert!(state.error_counts.is_zero());
        assert_eq!(fx.runtime.stops.load(Ordering::SeqCst), 1);

        // Budget of one is now spent.
        let outcome = reduce_workers(&fx.ctx()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped("worker reduction budget exhausted"));
        assert_eq!(fx.state().current_workers, 2);
    }

    #[tokio::test]
    async fn test_nonpositive_max_disables_restart() {
        let options = ToolOptions {
            enable_adaptive_restart: true,
            max_container_restarts: 0,
            ..ToolOptions::default()
        };
        let fx = Fixture::new(options);

        let outcome = restart_container(&fx.ctx()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped("container restart budget exhausted"));
    }

    #[tokio::test]
    async fn test_rotate_vpn_frequency_gate() {
        let options = ToolOptions {
            enable_vpn_rotation: true,
            vpn_connect_command: "true".to_string(),
            max_vpn_rotations: 5,
            vpn_rotation_frequency_minutes: 60,
            ..monitored()
        };
        let fx = Fixture::new(options);

        let outcome = rotate_vpn(&fx.ctx()).await.unwrap();
        assert!(outcome.is_applied());
        let after_first = fx.state().vpn_rotations_done;
        assert_eq!(after_first, 1);

        // Second rotation inside the frequency window: not due, untouched.
        let outcome = rotate_vpn(&fx.ctx()).await.unwrap();
        assert_eq!(outcome, Outcome::NotDue);
        assert_eq!(fx.state().vpn_rotations_done, 1);
    }

    #[tokio::test]
    async fn test_rotate_vpn_cancelled_settle_commits_nothing() {
        let options = ToolOptions {
            enable_vpn_rotation: true,
            vpn_connect_command: "true".to_string(),
            max_vpn_rotations: 5,
            ..monitored()
        };
        let mut fx = Fixture::new(options);
        fx.settings.vpn_settle = Duration::from_secs(30);

        let cancel = fx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let outcome = rotate_vpn(&fx.ctx()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped("cancelled during vpn settle"));
        let state = fx.state();
        assert_eq!(state.vpn_rotations_done, 0);
        assert!(state.last_vpn_rotation.is_none());
    }

    #[tokio::test]
    async fn test_rotate_vpn_missing_executable() {
        let options = ToolOptions {
            enable_vpn_rotation: true,
            vpn_connect_command: "definitely-not-a-real-binary-xyz".to_string(),
            max_vpn_rotations: 5,
            ..monitored()
        };
        let fx = Fixture::new(options);

        let outcome = rotate_vpn(&fx.ctx()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped("vpn connect command not on PATH"));
    }

    #[tokio::test]
    async fn test_apply_adaptations_falls_through_in_order() {
        // Reduction disabled, restart budget spent, rotation available.
        let options = ToolOptions {
            enable_adaptive_restart: true,
            max_container_restarts: 1,
            enable_vpn_rotation: true,
            vpn_connect_command: "true".to_string(),
            max_vpn_rotations: 2,
            ..monitored()
        };
        let fx = Fixture::new(options);
        let mut state = fx.state();
        state.container_restarts_done = 1;
        state.save(&fx.state_path).unwrap();

        let outcome = apply_adaptations(&fx.ctx()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                restart_required: false
            }
        );
        assert_eq!(fx.state().vpn_rotations_done, 1);
    }

    #[tokio::test]
    async fn test_apply_adaptations_exhausted() {
        let fx = Fixture::new(ToolOptions::default());
        let outcome = apply_adaptations(&fx.ctx()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Skipped("all strategies inapplicable or exhausted")
        );
    }
}
