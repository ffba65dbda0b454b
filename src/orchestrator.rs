//! One sync cycle: FolderVerify, Fetch, CompareDecision, then either
//! NoChange or Stage and Promote, then CacheRefresh.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::catalog::{load_published, CatalogCache};
use crate::config::Config;
use crate::detect::has_changed_or_unknown;
use crate::drive::StoreConnector;
use crate::error::{StepFailure, SyncError};
use crate::layout::{clear_container, clear_named, ensure_layout, read_named, write_in_place, LayoutNames};
use crate::model::{RecordSet, SyncReport, SyncStep};
use crate::promote::promote;
use crate::retry::RetryPolicy;
use crate::sheet::{fetch_and_normalize, NormalizeRules, SourceFetcher};
use crate::stage::{stage, StagingOptions};

/// Everything a cycle needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub locator: String,
    pub names: LayoutNames,
    pub rules: NormalizeRules,
    pub staging: StagingOptions,
    pub retry: RetryPolicy,
}

impl CycleSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            locator: cfg.source.sheet_url.clone(),
            names: cfg.layout_names(),
            rules: cfg.normalize_rules(),
            staging: cfg.staging_options(),
            retry: cfg.retry_policy(),
        }
    }
}

fn at<E: Into<SyncError>>(step: SyncStep) -> impl FnOnce(E) -> StepFailure {
    move |err| StepFailure::new(step, err)
}

pub struct Orchestrator {
    fetcher: Arc<dyn SourceFetcher>,
    connector: Arc<dyn StoreConnector>,
    catalog: Arc<CatalogCache>,
    settings: CycleSettings,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        connector: Arc<dyn StoreConnector>,
        catalog: Arc<CatalogCache>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            fetcher,
            connector,
            catalog,
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogCache> {
        &self.catalog
    }

    pub fn connector(&self) -> &Arc<dyn StoreConnector> {
        &self.connector
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Fill the catalog from the published record file without syncing.
    #[instrument(skip_all)]
    pub async fn load_catalog(&self) -> Result<usize, SyncError> {
        let handle = self.connector.connect().await?;
        match load_published(handle.as_ref(), &self.settings.names, &self.settings.retry).await? {
            Some(set) => {
                let n = set.len();
                self.catalog.replace(set);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Run one cycle to completion or to the first unrecoverable failure.
    /// `on_step` is called as each step begins.
    #[instrument(skip_all, fields(%run_id))]
    pub async fn run_cycle(
        &self,
        run_id: Uuid,
        on_step: &(dyn Fn(SyncStep) + Send + Sync),
    ) -> Result<SyncReport, StepFailure> {
        let started_at = Utc::now();
        let s = &self.settings;
        let retry = &s.retry;
        let enter = |step: SyncStep| {
            info!(%step, "sync step");
            on_step(step);
        };

        enter(SyncStep::FolderVerify);
        let handle = self
            .connector
            .connect()
            .await
            .map_err(at(SyncStep::FolderVerify))?;
        let store = handle.as_ref();
        let layout = ensure_layout(store, &s.names, retry)
            .await
            .map_err(at(SyncStep::FolderVerify))?;

        enter(SyncStep::Fetch);
        let fresh = fetch_and_normalize(self.fetcher.as_ref(), &s.locator, &s.rules)
            .await
            .map_err(at(SyncStep::Fetch))?;
        let encoded = fresh.to_csv().map_err(|err| {
            StepFailure::new(
                SyncStep::Fetch,
                SyncError::MalformedSource(format!("cannot encode fetched records: {}", err)),
            )
        })?;
        write_in_place(store, &layout.root, &s.names.staged_csv, &encoded, retry)
            .await
            .map_err(at(SyncStep::Fetch))?;

        enter(SyncStep::CompareDecision);
        let baseline = match read_named(store, &layout.root, &s.names.baseline_csv, retry).await {
            Ok(Some((_, bytes))) => RecordSet::from_csv(&bytes),
            Ok(None) => Ok(None),
            Err(err) => Err(err.into()),
        };
        let changes = has_changed_or_unknown(&fresh, baseline);

        let (staging, promotion) = if !changes {
            info!(records = fresh.len(), "no material change; clearing staged file");
            clear_named(store, &layout.root, &s.names.staged_csv, retry)
                .await
                .map_err(at(SyncStep::CompareDecision))?;
            (None, None)
        } else {
            info!(records = fresh.len(), "source changed; staging");
            enter(SyncStep::Stage);
            let leftovers = clear_container(store, &layout.scratch, retry)
                .await
                .map_err(at(SyncStep::Stage))?;
            if leftovers > 0 {
                info!(leftovers, "cleared stale scratch contents");
            }
            let staged = stage(
                self.connector.as_ref(),
                &fresh,
                &layout.scratch,
                &s.staging,
                retry,
            )
            .await
            .map_err(at(SyncStep::Stage))?;

            enter(SyncStep::Promote);
            let promoted = promote(store, &layout, &s.names, retry)
                .await
                .map_err(at(SyncStep::Promote))?;
            (Some(staged), Some(promoted))
        };

        enter(SyncStep::CacheRefresh);
        if let Some(published) = load_published(store, &s.names, retry)
            .await
            .map_err(at(SyncStep::CacheRefresh))?
        {
            self.catalog.replace(published);
        }

        let report = SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            changes,
            records: fresh.len(),
            staging,
            promotion,
        };
        info!(changes, records = report.records, "sync cycle finished");
        Ok(report)
    }
}
