use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regsync_core::SyncRun;
use regsync_storage::{PgStore, RunStore};
use regsync_sync::{engine_from_env, maybe_build_scheduler, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "regsync")]
#[command(about = "Business registry synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization now.
    Sync {
        /// Ignore the checksum gate.
        #[arg(long)]
        force: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// List recent runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the cron trigger until interrupted.
    Schedule,
}

fn print_run(run: &SyncRun) {
    println!(
        "{} {} {:<8} {} {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.id,
        run.status.as_str(),
        run.counters.summary(),
        run.message.as_deref().unwrap_or("")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Sync { force } => {
            let engine = engine_from_env(&config).await?;
            let run = engine.run(force).await.context("running registry sync")?;
            println!(
                "sync {}: run_id={} {} checksum={}",
                run.status,
                run.id,
                run.counters.summary(),
                run.checksum.as_deref().unwrap_or("-")
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to the partner database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Runs { limit } => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to the partner database")?;
            let runs = store.recent_runs(limit).await.context("loading run history")?;
            for run in &runs {
                print_run(run);
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                anyhow::bail!("scheduler disabled; set REGSYNC_SCHEDULER_ENABLED=true");
            }
            let engine = Arc::new(engine_from_env(&config).await?);
            let Some(sched) = maybe_build_scheduler(engine, &config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
