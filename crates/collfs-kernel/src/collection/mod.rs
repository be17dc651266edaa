//! Filesystem view of one collection.
//!
//! A [`CollectionFs`] is an in-memory tree materialized from a collection's
//! manifest. Structural changes happen under one tree lock; file content is
//! guarded per file (see [`crate::lock`]). Writes stay in memory until
//! [`sync`](CollectionFs::sync) uploads them and commits a new manifest.

mod handle;
pub mod node;
mod sync;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use collfs_keep::{
    ApiClient, BlockCache, BlockReader, KeepClient, KeepResult, Locator, SharedApiClient,
    SharedKeepClient,
};
use collfs_types::CollectionRecord;
use parking_lot::Mutex;

use crate::config::FsConfig;
use crate::context::OpContext;
use crate::lock::{LockLevel, OrderedRwLock};
use crate::manifest::Manifest;
use crate::snapshot::{SnapNode, Snapshot};
use crate::vfs::{DirEntry, FileAttr, OpenFlags, VPath, VfsError, VfsOps, VfsResult};

pub use handle::FileHandle;
use node::{DirNode, FileData, Node, new_file_cell};

/// Backing store and metadata service shared by many collections.
#[derive(Clone)]
pub struct Backend {
    keep: SharedKeepClient,
    api: SharedApiClient,
    reader: Arc<BlockReader>,
    timeout: Duration,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("cluster", &self.api.cluster_id())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(keep: SharedKeepClient, api: SharedApiClient, config: &FsConfig) -> Self {
        let cache = Arc::new(BlockCache::new(config.cache_max_blocks));
        Self::with_cache(keep, api, cache, config)
    }

    /// Share an existing block cache.
    pub fn with_cache(
        keep: SharedKeepClient,
        api: SharedApiClient,
        cache: Arc<BlockCache>,
        config: &FsConfig,
    ) -> Self {
        let reader = BlockReader::new(
            keep.clone(),
            cache,
            api.token(),
            config.signature_ttl(),
            config.backend_timeout(),
        );
        Self {
            keep,
            api,
            reader: Arc::new(reader),
            timeout: config.backend_timeout(),
        }
    }

    /// One store serving both blocks and metadata.
    pub fn from_store<S>(store: Arc<S>, config: &FsConfig) -> Self
    where
        S: KeepClient + ApiClient + 'static,
    {
        Self::new(store.clone(), store, config)
    }

    pub fn api(&self) -> &SharedApiClient {
        &self.api
    }

    pub fn keep(&self) -> &SharedKeepClient {
        &self.keep
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        self.reader.cache()
    }

    /// Run one backend call under the context and the per-call deadline.
    pub(crate) async fn call<T, F>(&self, ctx: &OpContext, fut: F) -> VfsResult<T>
    where
        F: Future<Output = KeepResult<T>>,
    {
        ctx.run(async {
            tokio::time::timeout(self.timeout, fut)
                .await
                .map_err(|_| VfsError::TimedOut)?
                .map_err(VfsError::from)
        })
        .await
    }

    pub(crate) async fn fetch_block(
        &self,
        ctx: &OpContext,
        locator: &Locator,
    ) -> VfsResult<Arc<Vec<u8>>> {
        ctx.run(async { self.reader.fetch(locator).await.map_err(VfsError::from) })
            .await
    }

    /// Re-sign `locator` if its signature has lapsed, or always with `force`.
    pub(crate) async fn fresh_locator(
        &self,
        ctx: &OpContext,
        locator: &Locator,
        force: bool,
    ) -> VfsResult<Locator> {
        ctx.run(async {
            self.reader
                .fresh_locator(locator, force)
                .await
                .map_err(VfsError::from)
        })
        .await
    }
}

/// Metadata that changes on commit.
#[derive(Debug)]
struct CommitState {
    record: CollectionRecord,
    storage_classes: Vec<String>,
}

struct Inner {
    id: String,
    read_only: bool,
    backend: Backend,
    config: Arc<FsConfig>,
    tree: OrderedRwLock<DirNode>,
    state: Mutex<CommitState>,
    /// Bumped on every change to the tree or to file content.
    mutations: AtomicU64,
    /// Value of `mutations` captured by the last successful sync.
    committed: AtomicU64,
    sync_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn touch(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn debug_locks(&self) -> bool {
        self.config.debug_locks
    }
}

/// One collection's tree. Cloning shares the same instance.
#[derive(Clone)]
pub struct CollectionFs {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CollectionFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionFs")
            .field("id", &self.inner.id)
            .field("read_only", &self.inner.read_only)
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl CollectionFs {
    /// Fetch a collection by UUID or portable data hash and build its tree.
    pub async fn load(
        ctx: &OpContext,
        backend: Backend,
        config: Arc<FsConfig>,
        id: &str,
    ) -> VfsResult<Self> {
        tracing::debug!(collection = %id, "loading collection");
        let record = backend.call(ctx, backend.api().get_collection(id)).await?;
        Self::from_record(backend, config, record)
    }

    /// Build from a record already in hand. Records without a UUID (fetched
    /// by portable data hash) give a read-only filesystem.
    pub fn from_record(
        backend: Backend,
        config: Arc<FsConfig>,
        record: CollectionRecord,
    ) -> VfsResult<Self> {
        let mtime = UNIX_EPOCH + Duration::from_secs(record.modified_at);
        let tree = Manifest::parse(&record.manifest_text)?.to_snapshot(mtime)?;
        let root = tree.materialize_dir(config.debug_locks);
        let storage_classes = if record.storage_classes_desired.is_empty() {
            config.default_storage_classes.clone()
        } else {
            record.storage_classes_desired.clone()
        };
        Ok(Self {
            inner: Arc::new(Inner {
                id: record.id().to_string(),
                read_only: record.uuid.is_none(),
                backend,
                tree: OrderedRwLock::new(LockLevel::Collection, config.debug_locks, root),
                config,
                state: Mutex::new(CommitState {
                    record,
                    storage_classes,
                }),
                mutations: AtomicU64::new(0),
                committed: AtomicU64::new(0),
                sync_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// UUID, or portable data hash for read-only collections.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// True when changes have been made since the last successful sync.
    pub fn is_dirty(&self) -> bool {
        self.inner.mutations.load(Ordering::SeqCst) != self.inner.committed.load(Ordering::SeqCst)
    }

    /// The record as of load or the last commit.
    pub fn record(&self) -> CollectionRecord {
        self.inner.state.lock().record.clone()
    }

    pub fn portable_data_hash(&self) -> String {
        self.inner.state.lock().record.portable_data_hash.clone()
    }

    /// Storage classes the next sync will ask for.
    pub fn storage_classes(&self) -> Vec<String> {
        self.inner.state.lock().storage_classes.clone()
    }

    /// Change the storage class policy. Takes effect on the next sync.
    pub fn set_storage_classes(&self, classes: Vec<String>) -> VfsResult<()> {
        self.check_writable()?;
        self.inner.state.lock().storage_classes = classes;
        self.inner.touch();
        Ok(())
    }

    pub fn same_as(&self, other: &CollectionFs) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.inner.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let p = VPath::parse(path);
        let tree = self.inner.tree.read();
        if p.is_root() {
            return Ok(FileAttr::directory(tree.mtime()));
        }
        tree.lookup(p.components())
            .map(Node::attr)
            .ok_or_else(|| VfsError::not_found(p.to_string()))
    }

    pub fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let p = VPath::parse(path);
        let tree = self.inner.tree.read();
        Ok(tree.dir(p.components())?.entries())
    }

    /// Open a file or directory.
    ///
    /// `create` adds a missing file (the parent must exist), `exclusive`
    /// makes an existing one an error, `truncate` empties it.
    pub fn open_file(&self, path: &str, flags: OpenFlags) -> VfsResult<FileHandle> {
        if flags.mutates() {
            self.check_writable()?;
        }
        let p = VPath::parse(path);
        let Some((parent, name)) = p.split_last() else {
            return self.open_node(None, p.clone(), flags);
        };

        if !flags.create {
            let tree = self.inner.tree.read();
            let node = tree
                .lookup(p.components())
                .ok_or_else(|| VfsError::not_found(p.to_string()))?;
            return self.open_node(Some(node), p.clone(), flags);
        }

        let mut tree = self.inner.tree.write();
        let dir = tree.dir_mut(parent)?;
        if let Some(node) = dir.child(name) {
            if flags.exclusive {
                return Err(VfsError::already_exists(p.to_string()));
            }
            return self.open_node(Some(node), p.clone(), flags);
        }
        let cell = new_file_cell(self.inner.debug_locks(), FileData::new(SystemTime::now()));
        dir.insert(name.to_string(), Node::File(cell.clone()));
        self.inner.touch();
        drop(tree);
        tracing::trace!(collection = %self.inner.id, path = %p, "created file");
        Ok(FileHandle::file(self.inner.clone(), cell, p, flags))
    }

    /// `None` is the root. Called with the tree lock held.
    fn open_node(&self, node: Option<&Node>, p: VPath, flags: OpenFlags) -> VfsResult<FileHandle> {
        match node {
            None | Some(Node::Dir(_)) => {
                if flags.write || flags.truncate {
                    return Err(VfsError::is_a_directory(p.to_string()));
                }
                Ok(FileHandle::dir(self.inner.clone(), p, flags))
            }
            Some(Node::File(cell)) => {
                if flags.truncate {
                    cell.write().truncate(0)?;
                    self.inner.touch();
                }
                Ok(FileHandle::file(self.inner.clone(), cell.clone(), p, flags))
            }
        }
    }

    /// Create a directory. Fails with `AlreadyExists` if anything occupies
    /// the name.
    pub fn mkdir(&self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let p = VPath::parse(path);
        let (parent, name) = p
            .split_last()
            .ok_or_else(|| VfsError::already_exists(p.to_string()))?;
        let mut tree = self.inner.tree.write();
        let dir = tree.dir_mut(parent)?;
        if dir.child(name).is_some() {
            return Err(VfsError::already_exists(p.to_string()));
        }
        dir.insert(name.to_string(), Node::Dir(DirNode::default()));
        self.inner.touch();
        Ok(())
    }

    /// Move a node. Replacing a file, or an empty directory with a
    /// directory, is allowed.
    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.check_writable()?;
        let src = VPath::parse(from);
        let dst = VPath::parse(to);
        let (Some((src_parent, src_name)), Some((dst_parent, dst_name))) =
            (src.split_last(), dst.split_last())
        else {
            return Err(VfsError::invalid_operation(format!(
                "cannot rename {} to {}: collection root",
                src, dst
            )));
        };

        let mut tree = self.inner.tree.write();
        let src_kind = tree
            .lookup(src.components())
            .map(Node::kind)
            .ok_or_else(|| VfsError::not_found(src.to_string()))?;
        if src.components() == dst.components() {
            return Ok(());
        }
        if dst.starts_with(&src) {
            return Err(VfsError::invalid_argument(format!(
                "cannot move {} into itself",
                src
            )));
        }
        match tree.dir(dst_parent)?.child(dst_name) {
            Some(Node::Dir(d)) if src_kind.is_dir() && !d.is_empty() => {
                return Err(VfsError::directory_not_empty(dst.to_string()));
            }
            Some(Node::Dir(_)) if src_kind.is_file() => {
                return Err(VfsError::is_a_directory(dst.to_string()));
            }
            Some(Node::File(_)) if src_kind.is_dir() => {
                return Err(VfsError::not_a_directory(dst.to_string()));
            }
            _ => {}
        }

        let node = tree
            .dir_mut(src_parent)?
            .remove(src_name)
            .ok_or_else(|| VfsError::not_found(src.to_string()))?;
        match tree.dir_mut(dst_parent) {
            Ok(dir) => {
                dir.insert(dst_name.to_string(), node);
            }
            Err(e) => {
                if let Ok(dir) = tree.dir_mut(src_parent) {
                    dir.insert(src_name.to_string(), node);
                }
                return Err(e);
            }
        }
        self.inner.touch();
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn remove(&self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let p = VPath::parse(path);
        let (parent, name) = p.split_last().ok_or_else(|| {
            VfsError::invalid_operation(format!("{}: cannot remove collection root", self.id()))
        })?;
        let mut tree = self.inner.tree.write();
        let dir = tree.dir_mut(parent)?;
        match dir.child(name) {
            None => return Err(VfsError::not_found(p.to_string())),
            Some(Node::Dir(d)) if !d.is_empty() => {
                return Err(VfsError::directory_not_empty(p.to_string()));
            }
            Some(_) => {}
        }
        dir.remove(name);
        self.inner.touch();
        Ok(())
    }

    /// Remove a subtree. Absent names are not an error; a missing parent is.
    pub fn remove_all(&self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let p = VPath::parse(path);
        let (parent, name) = p.split_last().ok_or_else(|| {
            VfsError::invalid_operation(format!("{}: cannot remove collection root", self.id()))
        })?;
        let mut tree = self.inner.tree.write();
        if tree.dir_mut(parent)?.remove(name).is_some() {
            self.inner.touch();
        }
        Ok(())
    }

    /// Capture the subtree at `path`.
    pub fn snapshot(&self, path: &str) -> VfsResult<Snapshot> {
        let p = VPath::parse(path);
        let tree = self.inner.tree.read();
        let node = if p.is_root() {
            SnapNode::capture_dir(&tree)
        } else {
            SnapNode::capture(
                tree.lookup(p.components())
                    .ok_or_else(|| VfsError::not_found(p.to_string()))?,
            )
        };
        Ok(Snapshot::new(node))
    }

    /// Graft a copy of `snapshot` at `path`.
    ///
    /// The target must not end with a separator and its parent must exist.
    /// An existing node there is replaced. At the root, a directory snapshot
    /// replaces the collection's contents and a file snapshot is rejected.
    pub fn splice(&self, path: &str, snapshot: &Snapshot) -> VfsResult<()> {
        let p = VPath::parse(path);
        if !p.is_root() && p.has_trailing_separator() {
            return Err(VfsError::invalid_argument(format!(
                "{}: splice target must not end with a separator",
                path
            )));
        }
        self.check_writable()?;

        let Some((parent, name)) = p.split_last() else {
            if !snapshot.is_dir() {
                return Err(VfsError::invalid_operation(
                    "cannot use Splice to attach a file at top level of collection filesystem",
                ));
            }
            let replacement = snapshot.node().materialize_dir(self.inner.debug_locks());
            let mut tree = self.inner.tree.write();
            tree.replace_children(replacement);
            self.inner.touch();
            return Ok(());
        };

        let node = snapshot.node().materialize(self.inner.debug_locks());
        let mut tree = self.inner.tree.write();
        tree.dir_mut(parent)?.insert(name.to_string(), node);
        self.inner.touch();
        Ok(())
    }

    /// Manifest text of the current tree. Fails while unsynced data exists.
    pub fn manifest_text(&self) -> VfsResult<String> {
        let snapshot = self.snapshot("")?;
        Ok(Manifest::from_snapshot(snapshot.node())?.to_string())
    }
}

#[async_trait]
impl VfsOps for CollectionFs {
    async fn stat(&self, _ctx: &OpContext, path: &str) -> VfsResult<FileAttr> {
        CollectionFs::stat(self, path)
    }

    async fn readdir(&self, _ctx: &OpContext, path: &str) -> VfsResult<Vec<DirEntry>> {
        CollectionFs::readdir(self, path)
    }

    async fn open_file(
        &self,
        _ctx: &OpContext,
        path: &str,
        flags: OpenFlags,
    ) -> VfsResult<FileHandle> {
        CollectionFs::open_file(self, path, flags)
    }

    async fn snapshot(&self, _ctx: &OpContext, path: &str) -> VfsResult<Snapshot> {
        CollectionFs::snapshot(self, path)
    }

    async fn mkdir(&self, _ctx: &OpContext, path: &str) -> VfsResult<()> {
        CollectionFs::mkdir(self, path)
    }

    async fn rename(&self, _ctx: &OpContext, from: &str, to: &str) -> VfsResult<()> {
        CollectionFs::rename(self, from, to)
    }

    async fn remove(&self, _ctx: &OpContext, path: &str) -> VfsResult<()> {
        CollectionFs::remove(self, path)
    }

    async fn remove_all(&self, _ctx: &OpContext, path: &str) -> VfsResult<()> {
        CollectionFs::remove_all(self, path)
    }

    async fn splice(&self, _ctx: &OpContext, path: &str, snapshot: &Snapshot) -> VfsResult<()> {
        CollectionFs::splice(self, path, snapshot)
    }

    async fn sync(&self, ctx: &OpContext) -> VfsResult<()> {
        CollectionFs::sync(self, ctx).await
    }

    fn read_only(&self) -> bool {
        self.is_read_only()
    }
}
