//! Read-only snapshot of the last published record set, served to clients.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument};

use crate::drive::RemoteStore;
use crate::error::SyncError;
use crate::layout::{read_named, LayoutNames};
use crate::model::RecordSet;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub records: Arc<RecordSet>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Single writer (the sync cycle), many readers. Readers get an `Arc` to an
/// immutable set and never wait on a running cycle.
#[derive(Debug, Default)]
pub struct CatalogCache {
    inner: RwLock<CatalogSnapshot>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn records(&self) -> Arc<RecordSet> {
        self.snapshot().records
    }

    pub fn replace(&self, set: RecordSet) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(records = set.len(), "catalog replaced");
        *guard = CatalogSnapshot {
            records: Arc::new(set),
            loaded_at: Some(Utc::now()),
        };
    }
}

/// Read the published record file. `None` when the layout or file does not
/// exist yet or the file is empty.
#[instrument(skip_all)]
pub async fn load_published(
    store: &dyn RemoteStore,
    names: &LayoutNames,
    retry: &RetryPolicy,
) -> Result<Option<RecordSet>, SyncError> {
    let root_name = names.root.as_str();
    let Some(root) = retry
        .run("find_folder", move || store.find_folder(None, root_name))
        .await?
    else {
        return Ok(None);
    };
    match read_named(store, &root.id, &names.published_csv, retry).await? {
        Some((_, bytes)) => RecordSet::from_csv(&bytes),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{MemoryStore, CSV_MIME};

    #[test]
    fn replace_swaps_snapshot() {
        let cache = CatalogCache::new();
        assert!(cache.records().is_empty());
        assert!(cache.snapshot().loaded_at.is_none());

        let before = cache.records();
        let set = RecordSet::from_csv(b"ID,D,P,L,M\n1,a,b,c,d\n").unwrap().unwrap();
        cache.replace(set);
        assert_eq!(cache.records().len(), 1);
        assert!(before.is_empty());
        assert!(cache.snapshot().loaded_at.is_some());
    }

    #[tokio::test]
    async fn load_published_handles_missing_and_present() {
        let store = MemoryStore::new();
        let names = LayoutNames::default();
        let retry = RetryPolicy::immediate(1);
        assert!(load_published(&store, &names, &retry).await.unwrap().is_none());

        let root = store.seed_folder(None, "Revive Auctions");
        let data = store.seed_file(&root, "data.csv", CSV_MIME, b"");
        assert!(load_published(&store, &names, &retry).await.unwrap().is_none());

        store
            .update_file(&data, CSV_MIME, b"ID,D,P,L,M\n1,a,b,c,d\n")
            .await
            .unwrap();
        let set = load_published(&store, &names, &retry).await.unwrap().unwrap();
        assert_eq!(set.records[0].media_ref, "d");
    }
}
