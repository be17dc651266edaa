//! The composed namespace.
//!
//! ```text
//! /
//! ├── by_id/<collection-uuid | pdh>/...     collection, loaded on first touch
//! ├── by_id/<project-uuid | user-uuid>/...  project directory
//! ├── users/<username>/...                  each user's home project
//! └── <mount>/...                           projects mounted by name (e.g. home)
//! ```
//!
//! Everything above a collection root is metadata-only: it can be listed
//! and stat'ed but not renamed, removed or written into. Every path below a
//! collection root belongs to exactly one [`CollectionFs`].

mod catalog;
mod mount;
mod project;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use collfs_types::{Identifier, ProjectItem, UserRecord};

pub use catalog::Catalog;
pub use mount::{BY_ID, Mount, MountInfo, MountTable, USERS};
pub use project::{ProjectEntry, assign_names};

use crate::collection::{Backend, CollectionFs, FileHandle};
use crate::config::FsConfig;
use crate::context::OpContext;
use crate::snapshot::Snapshot;
use crate::vfs::{DirEntry, FileAttr, OpenFlags, VPath, VfsError, VfsOps, VfsResult, path};
use project::{ProjectCache, entries_for};

/// A metadata-only directory.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MetaDir {
    Root,
    ById,
    Users,
    Project(String),
}

/// Where a site path lands.
enum Resolved {
    Meta(MetaDir),
    /// The last component is missing from a metadata-only directory.
    Absent { parent: MetaDir, name: String },
    /// Inside a collection; `rest` is empty at the collection root.
    Collection { fs: CollectionFs, rest: VPath },
}

/// Many collections composed into one tree.
pub struct SiteFs {
    backend: Backend,
    config: Arc<FsConfig>,
    mounts: MountTable,
    catalog: Catalog,
    projects: ProjectCache,
}

impl std::fmt::Debug for SiteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteFs")
            .field("backend", &self.backend)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl SiteFs {
    /// A site with the built-in `by_id` and `users` mounts.
    pub fn new(backend: Backend, config: FsConfig) -> Self {
        let config = Arc::new(config);
        Self {
            catalog: Catalog::new(backend.clone(), config.clone()),
            projects: ProjectCache::new(config.project_refresh(), config.debug_locks),
            mounts: MountTable::new(),
            backend,
            config,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Mount a project's tree at `/<name>`. An empty `project_uuid` mounts
    /// the current user's home project.
    pub async fn mount_project(
        &self,
        ctx: &OpContext,
        name: &str,
        project_uuid: &str,
    ) -> VfsResult<()> {
        let uuid = if project_uuid.is_empty() {
            let api = self.backend.api();
            self.backend.call(ctx, api.current_user()).await?.uuid
        } else {
            project_uuid.to_string()
        };
        tracing::debug!(mount = %name, project = %uuid, "mounting project");
        self.mounts.mount(name, Mount::Project(uuid)).await
    }

    pub async fn unmount(&self, name: &str) -> bool {
        self.mounts.unmount(name).await
    }

    pub async fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.list().await
    }

    /// The collection named by a UUID or portable data hash.
    pub async fn collection(&self, ctx: &OpContext, id: &str) -> VfsResult<CollectionFs> {
        if !Identifier::parse(id).is_collection() {
            return Err(VfsError::not_found(id));
        }
        self.catalog.get(ctx, id).await
    }

    pub fn loaded_collections(&self) -> Vec<CollectionFs> {
        self.catalog.loaded()
    }

    /// Evict a clean loaded collection. Cached project listings go too,
    /// since their records may predate the collection's last commit.
    pub fn forget(&self, id: &str) -> VfsResult<bool> {
        let forgotten = self.catalog.forget(id)?;
        if forgotten {
            self.projects.clear();
        }
        Ok(forgotten)
    }

    /// Create an empty collection owned by a project or user.
    pub async fn create_collection(
        &self,
        ctx: &OpContext,
        name: &str,
        owner_uuid: &str,
    ) -> VfsResult<CollectionFs> {
        let api = self.backend.api();
        let record = self
            .backend
            .call(ctx, api.create_collection(name, owner_uuid))
            .await?;
        tracing::info!(collection = %record.id(), owner = %owner_uuid, name = %name, "created collection");
        self.projects.invalidate(owner_uuid);
        self.catalog.get_from_record(record).await
    }

    async fn project_entries(
        &self,
        ctx: &OpContext,
        uuid: &str,
    ) -> VfsResult<Arc<Vec<ProjectEntry>>> {
        if let Some(entries) = self.projects.get(uuid) {
            return Ok(entries);
        }
        let api = self.backend.api();
        let items = self.backend.call(ctx, api.list_project(uuid)).await?;
        tracing::debug!(project = %uuid, items = items.len(), "fetched project listing");
        Ok(self.projects.put(uuid, entries_for(items)))
    }

    async fn user_entries(&self, ctx: &OpContext) -> VfsResult<Vec<(String, UserRecord)>> {
        let api = self.backend.api();
        let users = self.backend.call(ctx, api.list_users()).await?;
        Ok(assign_names(
            users
                .into_iter()
                .map(|u| (u.username.clone(), u.uuid.clone(), u))
                .collect(),
        ))
    }

    async fn resolve(&self, ctx: &OpContext, p: &VPath) -> VfsResult<Resolved> {
        let comps = p.components();
        let Some(first) = comps.first() else {
            return Ok(Resolved::Meta(MetaDir::Root));
        };
        let dir = match self.mounts.get(first).await {
            Some(Mount::ById) => MetaDir::ById,
            Some(Mount::Users) => MetaDir::Users,
            Some(Mount::Project(uuid)) => MetaDir::Project(uuid),
            None => return absent(MetaDir::Root, comps, 0),
        };
        self.walk(ctx, dir, comps, 1).await
    }

    async fn walk(
        &self,
        ctx: &OpContext,
        mut dir: MetaDir,
        comps: &[String],
        mut i: usize,
    ) -> VfsResult<Resolved> {
        while i < comps.len() {
            let name = &comps[i];
            let next = match &dir {
                MetaDir::Root => None,
                MetaDir::ById => match Identifier::parse(name) {
                    id if id.is_collection() => match self.catalog.get(ctx, id.as_str()).await {
                        Ok(fs) => return Ok(inside(fs, comps, i + 1)),
                        Err(VfsError::NotFound(_)) => None,
                        Err(e) => return Err(e),
                    },
                    Identifier::Project(uuid) | Identifier::User(uuid) => {
                        let api = self.backend.api();
                        match self.backend.call(ctx, api.get_project(&uuid)).await {
                            Ok(_) => Some(MetaDir::Project(uuid)),
                            Err(VfsError::NotFound(_)) => None,
                            Err(e) => return Err(e),
                        }
                    }
                    _ => None,
                },
                MetaDir::Users => self
                    .user_entries(ctx)
                    .await?
                    .into_iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, user)| MetaDir::Project(user.uuid)),
                MetaDir::Project(uuid) => {
                    let entries = self.project_entries(ctx, uuid).await?;
                    match entries.iter().find(|e| &e.name == name).map(|e| &e.item) {
                        Some(ProjectItem::Collection(record)) => {
                            let fs = self.catalog.get_from_record(record.clone()).await?;
                            return Ok(inside(fs, comps, i + 1));
                        }
                        Some(ProjectItem::Project(p)) => Some(MetaDir::Project(p.uuid.clone())),
                        None => None,
                    }
                }
            };
            match next {
                Some(d) => {
                    dir = d;
                    i += 1;
                }
                None => return absent(dir, comps, i),
            }
        }
        Ok(Resolved::Meta(dir))
    }

    async fn list_meta(&self, ctx: &OpContext, dir: &MetaDir) -> VfsResult<Vec<DirEntry>> {
        Ok(match dir {
            MetaDir::Root => self
                .mounts
                .list()
                .await
                .into_iter()
                .map(|m| DirEntry::directory(m.name))
                .collect(),
            MetaDir::ById => self
                .catalog
                .loaded_ids()
                .into_iter()
                .map(DirEntry::directory)
                .collect(),
            MetaDir::Users => self
                .user_entries(ctx)
                .await?
                .into_iter()
                .map(|(name, _)| DirEntry::directory(name))
                .collect(),
            MetaDir::Project(uuid) => self
                .project_entries(ctx, uuid)
                .await?
                .iter()
                .map(ProjectEntry::dir_entry)
                .collect(),
        })
    }

    pub async fn stat(&self, ctx: &OpContext, path: &str) -> VfsResult<FileAttr> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Meta(_) => Ok(FileAttr::directory(SystemTime::now())),
            Resolved::Collection { fs, rest } => fs.stat(&rest.to_string()),
            Resolved::Absent { .. } => Err(VfsError::not_found(p.to_string())),
        }
    }

    pub async fn readdir(&self, ctx: &OpContext, path: &str) -> VfsResult<Vec<DirEntry>> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Meta(dir) => self.list_meta(ctx, &dir).await,
            Resolved::Collection { fs, rest } => fs.readdir(&rest.to_string()),
            Resolved::Absent { .. } => Err(VfsError::not_found(p.to_string())),
        }
    }

    pub async fn open_file(
        &self,
        ctx: &OpContext,
        path: &str,
        flags: OpenFlags,
    ) -> VfsResult<FileHandle> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Collection { fs, rest } => fs.open_file(&rest.to_string(), flags),
            Resolved::Meta(dir) => {
                if flags.write || flags.truncate {
                    return Err(VfsError::is_a_directory(p.to_string()));
                }
                if flags.create && flags.exclusive {
                    return Err(VfsError::already_exists(p.to_string()));
                }
                let entries = self.list_meta(ctx, &dir).await?;
                Ok(FileHandle::listing(p, entries))
            }
            Resolved::Absent { .. } if flags.create => Err(VfsError::invalid_operation(format!(
                "{}: cannot create a file outside a collection",
                p
            ))),
            Resolved::Absent { .. } => Err(VfsError::not_found(p.to_string())),
        }
    }

    /// Inside a project directory, creates a new empty collection.
    pub async fn mkdir(&self, ctx: &OpContext, path: &str) -> VfsResult<()> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Collection { fs, rest } if !rest.is_root() => fs.mkdir(&rest.to_string()),
            Resolved::Collection { .. } | Resolved::Meta(_) => {
                Err(VfsError::already_exists(p.to_string()))
            }
            Resolved::Absent {
                parent: MetaDir::Project(owner),
                name,
            } => {
                self.create_collection(ctx, &name, &owner).await?;
                Ok(())
            }
            Resolved::Absent {
                parent: MetaDir::ById,
                name,
            } if Identifier::parse(&name).is_collection() => {
                Err(VfsError::already_exists(p.to_string()))
            }
            Resolved::Absent { .. } => Err(VfsError::invalid_operation(format!(
                "{}: cannot create a directory here",
                p
            ))),
        }
    }

    /// Rename within one collection. Anything crossing or touching a
    /// collection root fails with `InvalidOperation`.
    pub async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> VfsResult<()> {
        let src = VPath::parse(from);
        let dst = VPath::parse(to);
        let (src_fs, src_rest) = match self.resolve(ctx, &src).await? {
            Resolved::Collection { fs, rest } if !rest.is_root() => (fs, rest),
            Resolved::Absent { .. } => return Err(VfsError::not_found(src.to_string())),
            _ => {
                return Err(VfsError::invalid_operation(format!(
                    "cannot rename {}: not inside a collection",
                    src
                )));
            }
        };
        match self.resolve(ctx, &dst).await? {
            Resolved::Collection { fs, rest } if !rest.is_root() && fs.same_as(&src_fs) => {
                src_fs.rename(&src_rest.to_string(), &rest.to_string())
            }
            _ => Err(VfsError::invalid_operation(format!(
                "cannot rename {} to {}: different filesystems",
                src, dst
            ))),
        }
    }

    pub async fn remove(&self, ctx: &OpContext, path: &str) -> VfsResult<()> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Collection { fs, rest } if !rest.is_root() => fs.remove(&rest.to_string()),
            Resolved::Absent { .. } => Err(VfsError::not_found(p.to_string())),
            _ => Err(VfsError::invalid_operation(format!("cannot remove {}", p))),
        }
    }

    pub async fn remove_all(&self, ctx: &OpContext, path: &str) -> VfsResult<()> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Collection { fs, rest } if !rest.is_root() => {
                fs.remove_all(&rest.to_string())
            }
            Resolved::Absent { .. } => Ok(()),
            _ => Err(VfsError::invalid_operation(format!("cannot remove {}", p))),
        }
    }

    pub async fn snapshot(&self, ctx: &OpContext, path: &str) -> VfsResult<Snapshot> {
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Collection { fs, rest } => fs.snapshot(&rest.to_string()),
            Resolved::Meta(_) => Err(VfsError::invalid_operation(format!(
                "cannot snapshot {}: not inside a collection",
                p
            ))),
            Resolved::Absent { .. } => Err(VfsError::not_found(p.to_string())),
        }
    }

    /// Graft `snapshot` at `path`.
    ///
    /// Checked in order: the path must be non-empty with no trailing
    /// separator, its parent must exist, a collection root only accepts a
    /// directory, and the target must be inside a collection.
    pub async fn splice(&self, ctx: &OpContext, path: &str, snapshot: &Snapshot) -> VfsResult<()> {
        if path.is_empty() || path.ends_with('/') {
            return Err(VfsError::invalid_argument(format!(
                "{:?}: invalid splice target",
                path
            )));
        }
        let p = VPath::parse(path);
        match self.resolve(ctx, &p).await? {
            Resolved::Collection { fs, rest } if rest.is_root() => {
                if !snapshot.is_dir() {
                    return Err(VfsError::invalid_operation(format!(
                        "cannot use Splice to attach a file at top level of {} collection filesystem",
                        fs.id()
                    )));
                }
                fs.splice("", snapshot)
            }
            Resolved::Collection { fs, rest } => fs.splice(&rest.to_string(), snapshot),
            Resolved::Meta(_) | Resolved::Absent { .. } => Err(VfsError::invalid_operation(
                format!("cannot splice at {}: not inside a collection", p),
            )),
        }
    }

    /// Sync every loaded collection with changes. All are attempted; the
    /// first error is returned.
    pub async fn sync(&self, ctx: &OpContext) -> VfsResult<()> {
        let mut first_err = None;
        for fs in self.catalog.loaded() {
            if !fs.is_dirty() {
                continue;
            }
            if let Err(e) = fs.sync(ctx).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn inside(fs: CollectionFs, comps: &[String], from: usize) -> Resolved {
    Resolved::Collection {
        fs,
        rest: VPath::from_components(comps[from..].to_vec()),
    }
}

/// `comps[i]` is missing from `parent`: fine for the last component,
/// `NotFound` for an intermediate one.
fn absent(parent: MetaDir, comps: &[String], i: usize) -> VfsResult<Resolved> {
    if i + 1 == comps.len() {
        Ok(Resolved::Absent {
            parent,
            name: comps[i].clone(),
        })
    } else {
        Err(VfsError::not_found(path::display(&comps[..=i])))
    }
}

#[async_trait]
impl VfsOps for SiteFs {
    async fn stat(&self, ctx: &OpContext, path: &str) -> VfsResult<FileAttr> {
        SiteFs::stat(self, ctx, path).await
    }

    async fn readdir(&self, ctx: &OpContext, path: &str) -> VfsResult<Vec<DirEntry>> {
        SiteFs::readdir(self, ctx, path).await
    }

    async fn open_file(
        &self,
        ctx: &OpContext,
        path: &str,
        flags: OpenFlags,
    ) -> VfsResult<FileHandle> {
        SiteFs::open_file(self, ctx, path, flags).await
    }

    async fn snapshot(&self, ctx: &OpContext, path: &str) -> VfsResult<Snapshot> {
        SiteFs::snapshot(self, ctx, path).await
    }

    async fn mkdir(&self, ctx: &OpContext, path: &str) -> VfsResult<()> {
        SiteFs::mkdir(self, ctx, path).await
    }

    async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> VfsResult<()> {
        SiteFs::rename(self, ctx, from, to).await
    }

    async fn remove(&self, ctx: &OpContext, path: &str) -> VfsResult<()> {
        SiteFs::remove(self, ctx, path).await
    }

    async fn remove_all(&self, ctx: &OpContext, path: &str) -> VfsResult<()> {
        SiteFs::remove_all(self, ctx, path).await
    }

    async fn splice(&self, ctx: &OpContext, path: &str, snapshot: &Snapshot) -> VfsResult<()> {
        SiteFs::splice(self, ctx, path, snapshot).await
    }

    async fn sync(&self, ctx: &OpContext) -> VfsResult<()> {
        SiteFs::sync(self, ctx).await
    }

    fn read_only(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comps(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_absent_last_component_only() {
        let c = comps(&["home", "x"]);
        match absent(MetaDir::Project("p".into()), &c, 1).unwrap() {
            Resolved::Absent { parent, name } => {
                assert_eq!(parent, MetaDir::Project("p".into()));
                assert_eq!(name, "x");
            }
            _ => panic!("expected absent"),
        }
        let c = comps(&["home", "x", "y"]);
        let err = absent(MetaDir::Root, &c, 1).err().unwrap();
        assert!(matches!(err, VfsError::NotFound(ref p) if p == "/home/x"));
    }
}
