use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use parkrev_sync::config::DEFAULT_CONFIG_PATH;
use parkrev_sync::{AppConfig, JobKind, SyncRuntime, Target};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "parkrev-cli")]
#[command(about = "Parking revenue ingest, reconciliation and open-data publication")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args, Default)]
struct WindowArgs {
    /// Window start (YYYY-MM-DD, midnight UTC)
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Window end (YYYY-MM-DD, midnight UTC); defaults to now
    #[arg(long)]
    end: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Map raw vendor records into the operational tables
    Ingest {
        #[arg(long, default_value = "all")]
        source: Target,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Link settlement rows to vendor payments
    Reconcile {
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Label stored meter transactions that have no location name
    Backfill,
    /// Mirror recently updated rows into the open-data datasets
    Publish {
        #[arg(long, default_value = "all")]
        dataset: Target,
        #[command(flatten)]
        window: WindowArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AppConfig::load(&cli.config)?;
    tracing::debug!(config = %cli.config.display(), sources = config.sources.len(), "configuration loaded");
    let runtime = SyncRuntime::connect(config)?;

    let command = cli.command.unwrap_or(Commands::Publish {
        dataset: Target::All,
        window: WindowArgs::default(),
    });
    match command {
        Commands::Ingest { source, window } => {
            let window = runtime.window(JobKind::Ingest, window.start, window.end)?;
            for summary in runtime.ingest(&source, window).await? {
                println!(
                    "ingest complete: run_id={} source={} table={} received={} rejected={} duplicates={} upserted={} projected={}",
                    summary.run_id,
                    summary.source_id,
                    summary.table,
                    summary.received,
                    summary.rejected.len(),
                    summary.duplicates_dropped,
                    summary.upserted,
                    summary.projected
                );
            }
        }
        Commands::Reconcile { window } => {
            let window = runtime.window(JobKind::Reconcile, window.start, window.end)?;
            let summary = runtime.reconcile(window).await?;
            println!(
                "reconcile complete: run_id={} window={} considered={} linked={} unmatched={} excluded={}",
                summary.run_id,
                summary.window,
                summary.settlements_considered,
                summary.linked,
                summary.unmatched,
                summary.excluded
            );
        }
        Commands::Backfill => {
            let summary = runtime.backfill_locations().await?;
            println!(
                "backfill complete: run_id={} table={} pages={} labelled={} unknown={} projected={}",
                summary.run_id,
                summary.table,
                summary.pages,
                summary.rows_labelled,
                summary.unknown_locations,
                summary.projected
            );
        }
        Commands::Publish { dataset, window } => {
            let window = runtime.window(JobKind::Publish, window.start, window.end)?;
            for summary in runtime.publish(&dataset, window).await? {
                println!(
                    "publish complete: run_id={} dataset={} table={} pages={} rows={} created={} updated={}",
                    summary.run_id,
                    summary.dataset,
                    summary.table,
                    summary.pages,
                    summary.rows_published,
                    summary.rows_created,
                    summary.rows_updated
                );
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "parkrev_cli=debug,parkrev_sync=debug,parkrev_storage=debug,parkrev_adapters=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
