//! Loaded collections, keyed by identifier.
//!
//! Each identifier has at most one [`CollectionFs`]. Concurrent first
//! accesses share a single load; a failed load leaves no entry behind.

use std::sync::Arc;

use collfs_types::CollectionRecord;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::collection::{Backend, CollectionFs};
use crate::config::FsConfig;
use crate::context::OpContext;
use crate::vfs::{VfsError, VfsResult};

type Slot = Arc<OnceCell<CollectionFs>>;

pub struct Catalog {
    backend: Backend,
    config: Arc<FsConfig>,
    entries: DashMap<String, Slot>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("loaded", &self.loaded_ids())
            .finish_non_exhaustive()
    }
}

impl Catalog {
    pub fn new(backend: Backend, config: Arc<FsConfig>) -> Self {
        Self {
            backend,
            config,
            entries: DashMap::new(),
        }
    }

    fn slot(&self, id: &str) -> Slot {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn discard_if_empty(&self, id: &str) {
        self.entries.remove_if(id, |_, slot| !slot.initialized());
    }

    /// The collection named by a UUID or portable data hash, fetching it on
    /// first use.
    pub async fn get(&self, ctx: &OpContext, id: &str) -> VfsResult<CollectionFs> {
        let slot = self.slot(id);
        let result = slot
            .get_or_try_init(|| {
                CollectionFs::load(ctx, self.backend.clone(), self.config.clone(), id)
            })
            .await
            .cloned();
        if result.is_err() {
            self.discard_if_empty(id);
        }
        result
    }

    /// Like [`get`](Self::get), building from a record already fetched
    /// (e.g. from a project listing) instead of asking the backend. Waits
    /// for a load already in flight and returns its result.
    pub async fn get_from_record(&self, record: CollectionRecord) -> VfsResult<CollectionFs> {
        let id = record.id().to_string();
        let slot = self.slot(&id);
        let result = slot
            .get_or_try_init(|| async move {
                tracing::debug!(collection = %record.id(), "loading collection from listing");
                CollectionFs::from_record(self.backend.clone(), self.config.clone(), record)
            })
            .await
            .cloned();
        if result.is_err() {
            self.discard_if_empty(&id);
        }
        result
    }

    /// Identifiers with a loaded collection, sorted.
    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn loaded(&self) -> Vec<CollectionFs> {
        let mut loaded: Vec<CollectionFs> = self
            .entries
            .iter()
            .filter_map(|e| e.value().get().cloned())
            .collect();
        loaded.sort_by(|a, b| a.id().cmp(b.id()));
        loaded
    }

    /// Evict a loaded collection. Returns `false` if it was not loaded.
    /// A collection with unsynced changes is not evicted.
    pub fn forget(&self, id: &str) -> VfsResult<bool> {
        let dirty = self
            .entries
            .get(id)
            .and_then(|slot| slot.get().map(CollectionFs::is_dirty));
        match dirty {
            None => Ok(false),
            Some(true) => Err(VfsError::invalid_operation(format!(
                "{}: cannot forget a collection with unsynced changes",
                id
            ))),
            Some(false) => Ok(self.entries.remove(id).is_some()),
        }
    }
}
