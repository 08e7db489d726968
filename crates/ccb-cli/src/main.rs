use anyhow::{bail, Context, Result};
use ccb_storage::{BugStore, PgBugStore};
use ccb_sync::{RunMode, SyncConfig, SyncRunSummary};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "ccb-cli")]
#[command(about = "Ceph customer bug sync command-line interface")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One-time import of every customer bug into an empty table.
    Backfill,
    /// Ingest the last day's bugs, then re-check stored rows.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Export the downstream projection as a Parquet snapshot.
    Publish,
    /// Run the daily sync on the configured cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet)?;
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Backfill => {
            let summary = ccb_sync::run_from_config(&config, RunMode::Backfill).await?;
            print_summary("backfill", &summary);
        }
        Commands::Sync => {
            let summary = ccb_sync::run_from_config(&config, RunMode::Daily).await?;
            print_summary("sync", &summary);
        }
        Commands::Migrate => {
            let store = PgBugStore::connect(&config.database_url).await?;
            let result = store.migrate().await;
            store.close().await;
            result?;
            println!("migrations applied: table={}", ccb_core::BUG_TABLE);
        }
        Commands::Publish => {
            let manifest = ccb_sync::publish::run_publish_from_config(&config).await?;
            println!(
                "publish complete: run_id={} rows={} files={}",
                manifest.run_id,
                manifest.rows,
                manifest.files.len()
            );
        }
        Commands::Schedule => {
            let Some(mut sched) = ccb_sync::maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set CCB_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}

fn print_summary(label: &str, summary: &SyncRunSummary) {
    println!(
        "{label} complete: run_id={} inserted={} replaced={} failed={} reports={}",
        summary.run_id,
        summary.inserted(),
        summary.replaced(),
        summary.failed(),
        summary.reports_dir.as_deref().unwrap_or("-")
    );
}
