use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fts_core::DataMode;
use fts_sync::{
    current_year, ConfigProfile, SyncConfig, SyncPipeline, SyncRunSummary, YearRange, FIRST_YEAR,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fts-cli")]
#[command(about = "Collects FTS humanitarian funding data into a relational store")]
struct Cli {
    /// Configuration profile: production, development or test.
    #[arg(short, long, global = true, default_value_t = ConfigProfile::Development)]
    profile: ConfigProfile,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append historical records for one mode.
    Backfill {
        #[arg(short, long, default_value_t = FIRST_YEAR)]
        start: i32,
        /// Exclusive end year; defaults to next year.
        #[arg(short, long)]
        end: Option<i32>,
        #[arg(short, long, default_value_t = DataMode::Emergency)]
        mode: DataMode,
    },
    /// Refresh the current year's records for one mode.
    Populate {
        #[arg(short, long, default_value_t = DataMode::Emergency)]
        mode: DataMode,
    },
    /// Backfill every mode from the first year up to the current year.
    Init,
    /// Refresh every mode, on a schedule when the scheduler is enabled.
    Run,
    /// Create the tables.
    Migrate,
    /// Remove every row.
    Cleardb,
    /// Create the tables and remove every row.
    Setup,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "{} complete: run_id={} mode={} years={}..{} chunks={} deleted={} inserted={}{}",
        summary.strategy.as_str(),
        summary.run_id,
        summary.mode,
        summary.start_year,
        summary.end_year,
        summary.chunks,
        summary.deleted,
        summary.inserted,
        if summary.capped { " (row limit reached)" } else { "" }
    );
}

async fn execute(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env(cli.profile);
    info!(profile = %config.profile, row_limit = ?config.row_limit, "configuration loaded");
    let pipeline = Arc::new(SyncPipeline::connect(config).await?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Backfill { start, end, mode } => {
            let years = YearRange::resolve(Some(start), end, current_year());
            let summary = pipeline.backfill(mode, years).await?;
            print_summary(&summary);
        }
        Commands::Populate { mode } => {
            let summary = pipeline.populate(mode).await?;
            print_summary(&summary);
        }
        Commands::Init => {
            let years = YearRange::new(FIRST_YEAR, current_year());
            for summary in pipeline.backfill_all(years).await? {
                print_summary(&summary);
            }
        }
        Commands::Run => {
            if !pipeline.run_scheduled().await? {
                for summary in pipeline.populate_all().await? {
                    print_summary(&summary);
                }
            }
        }
        Commands::Migrate => {
            pipeline.migrate().await.context("creating tables")?;
            println!("database created");
        }
        Commands::Cleardb => {
            pipeline.clear().await.context("clearing tables")?;
            println!("database cleared");
        }
        Commands::Setup => {
            pipeline.migrate().await.context("creating tables")?;
            pipeline.clear().await.context("clearing tables")?;
            println!("database reset");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing("info") {
        eprintln!("{err:#}");
    }

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("command failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
