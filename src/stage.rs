//! Staging pipeline: copy each changed record's media into a numbered
//! subcontainer of the scratch area.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::drive::{AuthError, RemoteObject, StoreConnector, StoreError};
use crate::error::SyncError;
use crate::layout::{find_or_create_folder, make_public};
use crate::model::{Record, RecordSet};
use crate::retry::RetryPolicy;

static FOLDER_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/folders/([a-zA-Z0-9_-]+)").expect("valid folder regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingOptions {
    pub parallel: bool,
    pub concurrency: usize,
    pub max_images_per_record: usize,
    /// Only stage the first N records (partial runs).
    pub max_records: Option<usize>,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            concurrency: 5,
            max_images_per_record: 5,
            max_records: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed {
        images_copied: usize,
        folder_id: String,
    },
    Skipped {
        reason: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub record_id: u32,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagingSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub images_copied: usize,
    pub results: Vec<StageResult>,
}

impl StagingSummary {
    pub fn from_results(mut results: Vec<StageResult>) -> Self {
        results.sort_by_key(|r| r.record_id);
        let mut summary = StagingSummary::default();
        for r in &results {
            match &r.outcome {
                StageOutcome::Completed { images_copied, .. } => {
                    summary.completed += 1;
                    summary.images_copied += images_copied;
                }
                StageOutcome::Skipped { .. } => summary.skipped += 1,
                StageOutcome::Error { .. } => summary.failed += 1,
            }
        }
        summary.results = results;
        summary
    }

    pub fn outcome(&self, record_id: u32) -> Option<&StageOutcome> {
        self.results
            .iter()
            .find(|r| r.record_id == record_id)
            .map(|r| &r.outcome)
    }
}

/// Container id embedded in a folder link, if any.
pub fn extract_folder_id(link: &str) -> Option<&str> {
    FOLDER_ID
        .captures(link)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Extension for a copied item: from its name, else its mime type, else `jpg`.
pub fn image_extension(item: &RemoteObject) -> String {
    if let Some((_, ext)) = item.name.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_ascii_lowercase();
        }
    }
    match item.mime_type.as_str() {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "jpg",
    }
    .to_string()
}

/// Store errors that are not about one record and should stop the batch.
fn is_fatal(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Auth(AuthError::Configuration(_)) | StoreError::Auth(AuthError::Authentication(_))
    )
}

#[instrument(skip_all, fields(record_id = record.id))]
async fn stage_record(
    connector: &dyn StoreConnector,
    record: &Record,
    scratch: &str,
    opts: &StagingOptions,
    retry: &RetryPolicy,
) -> Result<StageOutcome, StoreError> {
    let Some(source) = extract_folder_id(&record.media_ref) else {
        info!("no valid media link; skipping");
        return Ok(StageOutcome::Skipped {
            reason: "no valid link".into(),
        });
    };

    // Each record gets its own handle; workers share no connection state.
    let handle = connector.connect().await?;
    let store = handle.as_ref();

    let name = record.id.to_string();
    let (folder, created) = find_or_create_folder(store, Some(scratch), &name, retry).await?;
    if created {
        make_public(store, &folder.id, retry).await;
    }

    let mut images: Vec<RemoteObject> = retry
        .run("list_children", move || store.list_children(source))
        .await?
        .into_iter()
        .filter(RemoteObject::is_image)
        .collect();
    images.sort_by(|a, b| a.name.cmp(&b.name));
    images.truncate(opts.max_images_per_record);

    let dest = folder.id.as_str();
    for (n, image) in images.iter().enumerate() {
        let target = format!("image_{}.{}", n + 1, image_extension(image));
        let (id, target) = (image.id.as_str(), target.as_str());
        let copied = retry
            .run("copy_file", move || store.copy_file(id, dest, target))
            .await?;
        debug!(source = %image.name, copy = %copied.name, "image copied");
        make_public(store, &copied.id, retry).await;
    }

    info!(images = images.len(), "record staged");
    Ok(StageOutcome::Completed {
        images_copied: images.len(),
        folder_id: folder.id,
    })
}

/// Stage every record of `set` under `scratch`. Per-record failures are
/// captured in the summary; only credential failures abort the batch.
#[instrument(skip_all, fields(records = set.len(), parallel = opts.parallel))]
pub async fn stage(
    connector: &dyn StoreConnector,
    set: &RecordSet,
    scratch: &str,
    opts: &StagingOptions,
    retry: &RetryPolicy,
) -> Result<StagingSummary, SyncError> {
    let limit = opts.max_records.unwrap_or(usize::MAX);
    let records: Vec<&Record> = set.records.iter().take(limit).collect();

    let outcomes: Vec<(u32, Result<StageOutcome, StoreError>)> =
        if opts.parallel && records.len() > 1 {
            stream::iter(records)
                .map(move |record| async move {
                    (
                        record.id,
                        stage_record(connector, record, scratch, opts, retry).await,
                    )
                })
                .buffer_unordered(opts.concurrency.max(1))
                .collect::<Vec<_>>()
                .boxed()
                .await
        } else {
            let mut out = Vec::with_capacity(records.len());
            for record in records {
                let outcome = stage_record(connector, record, scratch, opts, retry).await;
                out.push((record.id, outcome));
            }
            out
        };

    let mut results = Vec::with_capacity(outcomes.len());
    for (record_id, outcome) in outcomes {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) if is_fatal(&err) => return Err(err.into()),
            Err(err) => {
                warn!(record_id, error = %err, "staging failed for record");
                StageOutcome::Error {
                    error: err.to_string(),
                }
            }
        };
        results.push(StageResult { record_id, outcome });
    }

    let summary = StagingSummary::from_results(results);
    info!(
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        images = summary.images_copied,
        "staging finished"
    );
    Ok(summary)
}
