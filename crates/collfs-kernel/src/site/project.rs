//! Project directory listings.
//!
//! A project directory shows its collections and subprojects by display
//! name. Names are made path-safe (`/` becomes `_`, an empty name becomes
//! the UUID) and unique: items are considered in UUID order, the first keeps
//! the name and later ones get ` (<uuid>)` appended.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use collfs_types::ProjectItem;
use tokio::time::Instant;

use crate::lock::{LockLevel, OrderedRwLock};
use crate::vfs::DirEntry;

/// One named item in a project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    pub name: String,
    pub item: ProjectItem,
}

impl ProjectEntry {
    pub fn dir_entry(&self) -> DirEntry {
        DirEntry::directory(self.name.clone())
    }
}

/// Path-safe, unique names for `(name, uuid, value)` triples. The result
/// is sorted by assigned name.
pub fn assign_names<T>(mut items: Vec<(String, String, T)>) -> Vec<(String, T)> {
    items.sort_by(|a, b| a.1.cmp(&b.1));
    let mut taken = HashSet::new();
    let mut out: Vec<(String, T)> = Vec::with_capacity(items.len());
    for (name, uuid, value) in items {
        let mut name = name.replace('/', "_");
        if name.is_empty() || name == "." || name == ".." {
            name = uuid.clone();
        }
        if !taken.insert(name.clone()) {
            name = format!("{} ({})", name, uuid);
            taken.insert(name.clone());
        }
        out.push((name, value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

pub fn entries_for(items: Vec<ProjectItem>) -> Vec<ProjectEntry> {
    assign_names(
        items
            .into_iter()
            .map(|item| (item.name().to_string(), item.uuid().to_string(), item))
            .collect(),
    )
    .into_iter()
    .map(|(name, item)| ProjectEntry { name, item })
    .collect()
}

struct Cached {
    fetched: Instant,
    entries: Arc<Vec<ProjectEntry>>,
}

/// Project listings reused for a refresh interval.
pub struct ProjectCache {
    ttl: Duration,
    listings: OrderedRwLock<HashMap<String, Cached>>,
}

impl std::fmt::Debug for ProjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ProjectCache {
    pub fn new(ttl: Duration, debug_locks: bool) -> Self {
        Self {
            ttl,
            listings: OrderedRwLock::new(LockLevel::Site, debug_locks, HashMap::new()),
        }
    }

    /// A listing fetched less than `ttl` ago.
    pub fn get(&self, uuid: &str) -> Option<Arc<Vec<ProjectEntry>>> {
        let listings = self.listings.read();
        listings
            .get(uuid)
            .filter(|c| c.fetched.elapsed() < self.ttl)
            .map(|c| c.entries.clone())
    }

    pub fn put(&self, uuid: &str, entries: Vec<ProjectEntry>) -> Arc<Vec<ProjectEntry>> {
        let entries = Arc::new(entries);
        self.listings.write().insert(
            uuid.to_string(),
            Cached {
                fetched: Instant::now(),
                entries: entries.clone(),
            },
        );
        entries
    }

    pub fn invalidate(&self, uuid: &str) {
        self.listings.write().remove(uuid);
    }

    pub fn clear(&self) {
        self.listings.write().clear();
    }
}
