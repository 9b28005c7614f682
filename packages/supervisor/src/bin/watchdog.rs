// Stale-job recovery entry point, intended for a cron/systemd timer.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supervisor_core::jobs::PostgresJobStore;
use supervisor_core::watchdog::{CommandWorkerControl, Watchdog, WatchdogConfig};
use supervisor_core::SupervisorConfig;

#[derive(Parser)]
#[command(name = "watchdog", about = "Recover crawl jobs stuck in running")]
struct Args {
    /// Actually recover stale jobs instead of only reporting them.
    #[arg(long)]
    apply: bool,

    /// Age threshold for running jobs, in hours.
    #[arg(long, default_value_t = 12)]
    max_age_hours: i64,

    /// Progress-stall threshold, in minutes.
    #[arg(long, default_value_t = 90)]
    stall_minutes: i64,

    /// Max recoveries per job per rolling day.
    #[arg(long, default_value_t = 3)]
    max_recoveries_per_day: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,supervisor_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = SupervisorConfig::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PostgresJobStore::new(pool));

    let mut watchdog = Watchdog::new(
        store,
        WatchdogConfig {
            max_running_age: chrono::Duration::hours(args.max_age_hours),
            stall_threshold: chrono::Duration::minutes(args.stall_minutes),
            max_recoveries_per_day: args.max_recoveries_per_day,
            state_dir: config.state_dir.clone(),
        },
    );
    if let Some(cmd) = &config.worker_restart_command {
        watchdog = watchdog.with_worker_control(Arc::new(CommandWorkerControl::new(cmd)));
    }

    let reports = watchdog.run_once(args.apply).await?;
    if reports.is_empty() {
        tracing::info!("no stale jobs found");
    }
    for report in &reports {
        tracing::info!(
            job_id = %report.job_id,
            source = %report.source,
            reason = ?report.reason,
            applied = report.applied,
            rate_limited = report.rate_limited,
            "stale job"
        );
    }
    Ok(())
}
