//! Collection filesystem kernel.
//!
//! Two layers:
//!
//! - [`CollectionFs`]: one collection as a mutable tree of files and
//!   directories, lazily backed by immutable blocks and persisted by
//!   [`sync`](CollectionFs::sync) as a manifest.
//! - [`SiteFs`]: many collections composed under `by_id`, `users` and
//!   project mounts, loading each collection on first touch.
//!
//! Both implement [`VfsOps`]. Subtrees move between them as [`Snapshot`]s:
//! take one anywhere, [`splice`](VfsOps::splice) it in anywhere else, and
//! the two copies diverge independently from then on.

pub mod collection;
pub mod config;
pub mod context;
pub mod lock;
pub mod manifest;
pub mod site;
pub mod snapshot;
pub mod vfs;

pub use collection::{Backend, CollectionFs, FileHandle};
pub use config::{ConfigError, FsConfig};
pub use context::OpContext;
pub use manifest::{Manifest, ManifestError};
pub use site::{Mount, MountInfo, SiteFs};
pub use snapshot::{SnapNode, Snapshot};
pub use vfs::{DirEntry, FileAttr, FileType, OpenFlags, VPath, VfsError, VfsOps, VfsResult};
