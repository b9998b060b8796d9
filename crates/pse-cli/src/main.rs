use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pse_sync::destination::connect_store;
use pse_sync::extract::build_adapter;
use pse_sync::scheduler::run_scheduled_sync;
use pse_sync::{BackfillRequest, DestinationKind, JobAction, JobOptions, LakeDestination, SyncConfig, SyncJob};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pse-cli")]
#[command(about = "Sync PSE company listings and daily prices into a destination store")]
struct Cli {
    /// postgres, bigquery, lake or memory. Overrides PSE_DESTINATION.
    #[arg(long, global = true)]
    destination: Option<DestinationKind>,
    /// Price-history extraction units in flight at once. Overrides PSE_CONCURRENCY.
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incremental sync of companies and recent prices.
    Sync,
    /// Re-extract and reconcile a historical date range.
    Backfill(BackfillArgs),
    /// Create destination tables if missing.
    InitializeSchema,
    /// Run `sync` on a cron schedule until Ctrl-C.
    Schedule {
        /// Six-field cron expression. Defaults to PSE_SCHEDULER_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
    /// Delete lake data files no longer referenced by the table log.
    Vacuum {
        #[arg(long, default_value_t = 168)]
        retention_hours: u64,
    },
}

#[derive(Debug, Args)]
struct BackfillArgs {
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Comma-separated symbols; defaults to every listed company.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    #[arg(long)]
    chunk_days: Option<u32>,
}

impl From<BackfillArgs> for BackfillRequest {
    fn from(args: BackfillArgs) -> Self {
        BackfillRequest {
            from: args.from,
            to: args.to,
            symbols: (!args.symbols.is_empty()).then_some(args.symbols),
            chunk_days: args.chunk_days,
        }
    }
}

fn init_tracing() {
    let log_format = std::env::var("PSE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn build_job(config: &SyncConfig) -> Result<SyncJob> {
    let store = connect_store(config)
        .await
        .with_context(|| format!("connecting to {} destination", config.destination.as_str()))?;
    let adapter = build_adapter(config)?;
    Ok(SyncJob::new(adapter, store, JobOptions::from_config(config)))
}

async fn run_once(config: &SyncConfig, action: JobAction) -> Result<ExitCode> {
    let job = build_job(config).await?;
    let report = job.run(action).await;
    println!(
        "{} finished: run_id={} status={:?} companies={} prices={} stale_skipped={} extraction_failures={}",
        report.action,
        report.run_id,
        report.status,
        report.companies.stats.eligible,
        report.prices.stats.eligible,
        report.prices.stats.skipped_stale,
        report.extraction_failures.len(),
    );
    if let Some(error) = &report.error {
        eprintln!("{}: {}", error.code, error.message);
    }
    Ok(if report.status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn vacuum(config: &SyncConfig, retention_hours: u64) -> Result<ExitCode> {
    if config.destination != DestinationKind::Lake {
        bail!("vacuum applies to the lake destination only (got {})", config.destination.as_str());
    }
    let lake = LakeDestination::new(config.lake_uri.clone()).with_storage_options(config.lake_storage_options());
    let retention = Duration::from_secs(retention_hours.saturating_mul(3600));
    let deleted = lake.vacuum(retention).await?;
    println!("vacuum complete: uri={} files_deleted={deleted}", config.lake_uri);
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(destination) = cli.destination {
        config.destination = destination;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency.max(1);
    }
    info!(destination = config.destination.as_str(), concurrency = config.concurrency, "configuration loaded");

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => run_once(&config, JobAction::Sync).await,
        Commands::Backfill(args) => run_once(&config, JobAction::Backfill(args.into())).await,
        Commands::InitializeSchema => run_once(&config, JobAction::InitializeSchema).await,
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.scheduler_cron.clone());
            let job = build_job(&config).await?;
            run_scheduled_sync(&cron, Arc::new(job)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Vacuum { retention_hours } => vacuum(&config, retention_hours).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_flags_become_a_request() {
        let cli = Cli::try_parse_from([
            "pse-cli",
            "--destination",
            "lake",
            "backfill",
            "--from",
            "2024-01-01",
            "--to",
            "2024-01-31",
            "--symbols",
            "AC,BDO",
            "--chunk-days",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.destination, Some(DestinationKind::Lake));
        let Some(Commands::Backfill(args)) = cli.command else {
            panic!("expected backfill");
        };
        let request = BackfillRequest::from(args);
        assert_eq!(request.symbols, Some(vec!["AC".to_string(), "BDO".to_string()]));
        assert_eq!(request.chunk_days, Some(7));
        assert_eq!(request.from, NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn unknown_destination_is_rejected() {
        assert!(Cli::try_parse_from(["pse-cli", "--destination", "oracle", "sync"]).is_err());
    }

    #[test]
    fn subcommand_is_optional() {
        let cli = Cli::try_parse_from(["pse-cli", "--concurrency", "4"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.concurrency, Some(4));
    }
}
