//! Persisted layout of the mirror inside the remote store, and the small
//! name-addressed helpers every step uses to read and write it.

use tracing::{info, instrument, warn};

use crate::drive::{RemoteObject, RemoteStore, StoreError, CSV_MIME};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutNames {
    pub root: String,
    pub scratch: String,
    pub published: String,
    pub staged_csv: String,
    pub baseline_csv: String,
    pub published_csv: String,
}

impl Default for LayoutNames {
    fn default() -> Self {
        Self {
            root: "Revive Auctions".into(),
            scratch: "Buffer".into(),
            published: "Images".into(),
            staged_csv: "buffer.csv".into(),
            baseline_csv: "source.csv".into(),
            published_csv: "data.csv".into(),
        }
    }
}

/// Resolved container ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub root: String,
    pub scratch: String,
    pub published: String,
}

/// Mark an object publicly readable. Failures are logged, never fatal.
pub async fn make_public(store: &dyn RemoteStore, id: &str, retry: &RetryPolicy) {
    if let Err(err) = retry.run("set_public", move || store.set_public(id)).await {
        warn!(id, error = %err, "could not make object public");
    }
}

/// Find a container by name under `parent`, creating it when absent.
/// Returns the container and whether it was created.
pub async fn find_or_create_folder(
    store: &dyn RemoteStore,
    parent: Option<&str>,
    name: &str,
    retry: &RetryPolicy,
) -> Result<(RemoteObject, bool), StoreError> {
    if let Some(found) = retry
        .run("find_folder", move || store.find_folder(parent, name))
        .await?
    {
        return Ok((found, false));
    }
    let created = retry
        .run("create_folder", move || store.create_folder(parent, name))
        .await?;
    Ok((created, true))
}

pub async fn find_named(
    store: &dyn RemoteStore,
    parent: &str,
    name: &str,
    retry: &RetryPolicy,
) -> Result<Option<RemoteObject>, StoreError> {
    retry
        .run("find_file", move || store.find_file(parent, name))
        .await
}

/// Read a named file. `None` when it does not exist.
pub async fn read_named(
    store: &dyn RemoteStore,
    parent: &str,
    name: &str,
    retry: &RetryPolicy,
) -> Result<Option<(RemoteObject, Vec<u8>)>, StoreError> {
    let Some(file) = find_named(store, parent, name, retry).await? else {
        return Ok(None);
    };
    let id = file.id.as_str();
    let bytes = retry.run("read_file", move || store.read_file(id)).await?;
    Ok(Some((file, bytes)))
}

/// Overwrite a named file's content in place, keeping its id. Creates the
/// file only when none exists yet.
pub async fn write_in_place(
    store: &dyn RemoteStore,
    parent: &str,
    name: &str,
    content: &[u8],
    retry: &RetryPolicy,
) -> Result<RemoteObject, StoreError> {
    match find_named(store, parent, name, retry).await? {
        Some(file) => {
            let id = file.id.as_str();
            retry
                .run("update_file", move || store.update_file(id, CSV_MIME, content))
                .await?;
            Ok(file)
        }
        None => {
            // Only the upload is retried, so a failed upload never leaves
            // a second file with the same name behind.
            let created = retry
                .run("create_file", move || store.create_file(parent, name, CSV_MIME, b""))
                .await?;
            if !content.is_empty() {
                let id = created.id.as_str();
                retry
                    .run("update_file", move || store.update_file(id, CSV_MIME, content))
                    .await?;
            }
            make_public(store, &created.id, retry).await;
            Ok(created)
        }
    }
}

/// Empty a named file without changing its identity.
pub async fn clear_named(
    store: &dyn RemoteStore,
    parent: &str,
    name: &str,
    retry: &RetryPolicy,
) -> Result<(), StoreError> {
    if let Some(file) = find_named(store, parent, name, retry).await? {
        let id = file.id.as_str();
        retry
            .run("update_file", move || store.update_file(id, CSV_MIME, b""))
            .await?;
    }
    Ok(())
}

/// Delete every direct child of a container.
pub async fn clear_container(
    store: &dyn RemoteStore,
    container: &str,
    retry: &RetryPolicy,
) -> Result<usize, StoreError> {
    let children = retry
        .run("list_children", move || store.list_children(container))
        .await?;
    for child in &children {
        let id = child.id.as_str();
        retry.run("delete", move || store.delete(id)).await?;
    }
    Ok(children.len())
}

/// Make sure the root, scratch and published containers and the three
/// record files exist. Never deletes or overwrites anything.
#[instrument(skip_all)]
pub async fn ensure_layout(
    store: &dyn RemoteStore,
    names: &LayoutNames,
    retry: &RetryPolicy,
) -> Result<StoreLayout, StoreError> {
    let (root, created) = find_or_create_folder(store, None, &names.root, retry).await?;
    if created {
        info!(name = %names.root, id = %root.id, "created root container");
        make_public(store, &root.id, retry).await;
    }

    let mut ids = Vec::with_capacity(2);
    for name in [&names.scratch, &names.published] {
        let (folder, created) = find_or_create_folder(store, Some(root.id.as_str()), name, retry).await?;
        if created {
            info!(name = %name, id = %folder.id, "created container");
            make_public(store, &folder.id, retry).await;
        }
        ids.push(folder.id);
    }
    let published = ids.pop().unwrap_or_default();
    let scratch = ids.pop().unwrap_or_default();

    for name in [&names.staged_csv, &names.baseline_csv, &names.published_csv] {
        if find_named(store, &root.id, name, retry).await?.is_none() {
            let root_id = root.id.as_str();
            let file = retry
                .run("create_file", move || {
                    store.create_file(root_id, name, CSV_MIME, b"")
                })
                .await?;
            info!(name = %name, id = %file.id, "created record file");
            make_public(store, &file.id, retry).await;
        }
    }

    Ok(StoreLayout {
        root: root.id,
        scratch,
        published,
    })
}
