use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use auction_sync::catalog::CatalogCache;
use auction_sync::config;
use auction_sync::drive::{DriveConnector, TokenProvider};
use auction_sync::orchestrator::{CycleSettings, Orchestrator};
use auction_sync::service::SyncService;
use auction_sync::sheet::SheetFetcher;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run exactly one sync cycle in the foreground and print the report"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Stage only the first N records
    #[arg(long)]
    max_records: Option<usize>,

    /// Stage records one at a time instead of in parallel
    #[arg(long)]
    sequential: bool,

    /// Copy at most N images per record
    #[arg(long)]
    max_images: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if args.max_records.is_some() {
        cfg.staging.max_records = args.max_records;
    }
    if args.sequential {
        cfg.staging.parallel = false;
    }
    if let Some(max_images) = args.max_images {
        cfg.staging.max_images_per_record = max_images;
    }
    config::validate(&cfg)?;

    let tokens = Arc::new(TokenProvider::new(cfg.token_path(), cfg.drive_timeout()));
    let orchestrator = Orchestrator::new(
        Arc::new(SheetFetcher::new(cfg.source_timeout())),
        Arc::new(DriveConnector::new(tokens, cfg.drive_timeout())),
        Arc::new(CatalogCache::new()),
        CycleSettings::from_config(&cfg),
    );
    let service = SyncService::new(orchestrator);

    info!(
        parallel = cfg.staging.parallel,
        max_records = ?cfg.staging.max_records,
        max_images = cfg.staging.max_images_per_record,
        "running one sync cycle"
    );
    let report = service
        .run_now()
        .await
        .ok_or_else(|| anyhow!("a sync cycle is already running"))??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
