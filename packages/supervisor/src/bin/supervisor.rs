// Worker-loop entry point: claims and supervises crawl jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supervisor_core::guardrails::{CommandTiering, NoopTiering, StorageTiering};
use supervisor_core::jobs::{
    CommandIndexer, Indexer, NoopIndexer, PollOutcome, PostgresJobStore, WorkerConfig, WorkerLoop,
};
use supervisor_core::stage::DockerRuntime;
use supervisor_core::SupervisorConfig;

#[derive(Parser)]
#[command(name = "supervisor", about = "Crawl job worker loop")]
struct Args {
    /// Perform exactly one poll iteration and exit.
    #[arg(long)]
    once: bool,

    /// Override the poll interval from the environment.
    #[arg(long)]
    poll_interval_secs: Option<u64>,
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

    tracing::info!("Connecting to job store...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresJobStore::new(pool));
    let runtime = Arc::new(
        DockerRuntime::new(&config.crawler_image).with_extra_args(config.docker_args.clone()),
    );
    let indexer: Arc<dyn Indexer> = match &config.indexer_command {
        Some(cmd) => Arc::new(CommandIndexer::new(cmd)),
        None => Arc::new(NoopIndexer),
    };
    let tiering: Arc<dyn StorageTiering> = match &config.tiering_command {
        Some(cmd) => Arc::new(CommandTiering::new(cmd)),
        None => Arc::new(NoopTiering),
    };

    let worker = WorkerLoop::new(store, runtime, indexer, tiering).with_config(WorkerConfig {
        poll_interval: Duration::from_secs(
            args.poll_interval_secs.unwrap_or(config.poll_interval_secs),
        ),
        working_volume: config.working_volume.clone(),
        disk_threshold_percent: config.disk_threshold_percent,
        ..WorkerConfig::default()
    });

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        shutdown.cancel();
    });

    if args.once {
        match worker.run_once().await? {
            PollOutcome::Processed(job_id) => tracing::info!(%job_id, "processed one job"),
            PollOutcome::NoWork => tracing::info!("no eligible job"),
        }
        return Ok(());
    }

    worker.run().await
}
