use anyhow::{Context, Result};
use chrono::FixedOffset;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use auction_sync::catalog::CatalogCache;
use auction_sync::config;
use auction_sync::drive::{DriveConnector, TokenProvider};
use auction_sync::orchestrator::{CycleSettings, Orchestrator};
use auction_sync::scheduler;
use auction_sync::server::{self, AppState};
use auction_sync::service::SyncService;
use auction_sync::sheet::SheetFetcher;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let tokens = Arc::new(TokenProvider::new(cfg.token_path(), cfg.drive_timeout()));
    let connector = Arc::new(DriveConnector::new(tokens, cfg.drive_timeout()));
    let fetcher = Arc::new(SheetFetcher::new(cfg.source_timeout()));
    let orchestrator = Orchestrator::new(
        fetcher,
        connector,
        Arc::new(CatalogCache::new()),
        CycleSettings::from_config(&cfg),
    );
    let service = SyncService::new(orchestrator);

    match service.orchestrator().load_catalog().await {
        Ok(records) => info!(records, "catalog loaded from published record file"),
        Err(err) => warn!(error = %err, "could not load published catalog; serving empty"),
    }

    if cfg.app.sync_on_startup {
        let outcome = service.trigger_sync();
        info!(?outcome, "startup sync");
    }

    if cfg.schedule.enabled {
        let offset = FixedOffset::east_opt(cfg.schedule.utc_offset_minutes * 60)
            .context("schedule.utc_offset_minutes out of range")?;
        scheduler::spawn_daily(service.clone(), cfg.daily_at()?, offset);
    }

    let state = AppState {
        service,
        sync_on_catalog_request: cfg.app.sync_on_catalog_request,
    };
    server::serve(state, cfg.bind_addr()?).await
}
