//! Promotion: retire the published media tree and record file in favour of
//! the staged ones.
//!
//! Every step re-derives its inputs from what is in the store, so running
//! `promote` again after a partial failure (or twice in a row) converges on
//! the same published state. The baseline file is written last, after the
//! rebuilt record file; until then the next cycle sees a change and re-stages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument};

use crate::drive::RemoteStore;
use crate::error::SyncError;
use crate::layout::{clear_container, read_named, write_in_place, LayoutNames, StoreLayout};
use crate::model::RecordSet;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromotionSummary {
    /// Whether the published media tree was replaced (steps 1 and 2 ran).
    pub media_replaced: bool,
    pub removed: usize,
    pub moved: usize,
    pub records: usize,
    pub links_rewritten: usize,
    pub published_csv_id: Option<String>,
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

#[instrument(skip_all)]
pub async fn promote(
    store: &dyn RemoteStore,
    layout: &StoreLayout,
    names: &LayoutNames,
    retry: &RetryPolicy,
) -> Result<PromotionSummary, SyncError> {
    let mut summary = PromotionSummary::default();
    let root = layout.root.as_str();
    let (scratch, published) = (layout.scratch.as_str(), layout.published.as_str());

    let staged = read_named(store, root, &names.staged_csv, retry).await?;
    let staged_bytes = staged
        .as_ref()
        .map(|(_, bytes)| bytes.as_slice())
        .filter(|bytes| !is_blank(bytes));
    let baseline = read_named(store, root, &names.baseline_csv, retry)
        .await?
        .map(|(_, bytes)| bytes)
        .unwrap_or_default();
    let scratch_children = retry
        .run("list_children", move || store.list_children(scratch))
        .await?;

    // Staged media, or a staged record set not yet recorded as the baseline.
    let pending = !scratch_children.is_empty()
        || staged_bytes.map_or(false, |bytes| bytes != baseline.as_slice());

    if pending {
        summary.removed = clear_container(store, published, retry).await?;
        info!(removed = summary.removed, "published media cleared");

        for child in &scratch_children {
            let id = child.id.as_str();
            retry
                .run("move_object", move || store.move_object(id, scratch, published))
                .await?;
        }
        summary.moved = scratch_children.len();
        summary.media_replaced = true;
        info!(moved = summary.moved, "staged media published");
    } else {
        info!("no staged media pending; keeping published tree");
    }

    if let Some(bytes) = staged_bytes {
        write_in_place(store, root, &names.published_csv, bytes, retry).await?;
    }

    if let Some((file, _)) = &staged {
        let id = file.id.as_str();
        retry.run("delete", move || store.delete(id)).await?;
    }

    rewrite_links(store, root, published, names, retry, &mut summary).await?;

    if let Some(bytes) = staged_bytes {
        write_in_place(store, root, &names.baseline_csv, bytes, retry).await?;
        info!("baseline recorded");
    }
    Ok(summary)
}

/// Point every record that has a published folder at that folder's link.
async fn rewrite_links(
    store: &dyn RemoteStore,
    root: &str,
    published: &str,
    names: &LayoutNames,
    retry: &RetryPolicy,
    summary: &mut PromotionSummary,
) -> Result<(), SyncError> {
    let Some((file, current)) = read_named(store, root, &names.published_csv, retry).await? else {
        return Ok(());
    };
    summary.published_csv_id = Some(file.id);
    let Some(mut set) = RecordSet::from_csv(&current)? else {
        return Ok(());
    };

    let links: HashMap<String, String> = retry
        .run("list_children", move || store.list_children(published))
        .await?
        .into_iter()
        .filter(|o| o.is_folder())
        .map(|o| {
            let link = o.public_link();
            (o.name, link)
        })
        .collect();

    // Records without a published folder keep their previous reference.
    for record in &mut set.records {
        if let Some(link) = links.get(&record.id.to_string()) {
            if record.media_ref != *link {
                record.media_ref = link.clone();
                summary.links_rewritten += 1;
            }
        }
    }
    summary.records = set.len();

    let encoded = set.to_csv().map_err(|err| {
        SyncError::MalformedSource(format!("cannot encode {}: {}", names.published_csv, err))
    })?;
    write_in_place(store, root, &names.published_csv, &encoded, retry).await?;
    info!(
        records = summary.records,
        rewritten = summary.links_rewritten,
        "published record file rebuilt"
    );
    Ok(())
}
