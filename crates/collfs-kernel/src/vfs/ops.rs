//! Filesystem surface trait.
//!
//! Implemented by [`CollectionFs`](crate::CollectionFs) (one collection)
//! and [`SiteFs`](crate::SiteFs) (the composed namespace), so consumers
//! such as an HTTP gateway or the CLI can serve either.

use async_trait::async_trait;

use super::types::{DirEntry, FileAttr, OpenFlags};
use super::{VfsError, VfsResult};
use crate::collection::FileHandle;
use crate::context::OpContext;
use crate::snapshot::Snapshot;

/// Path-based filesystem operations.
///
/// Paths are `/`-separated and relative to the filesystem's root. Only
/// operations that reach the backing store consult `ctx`.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get attributes of the node at `path`.
    async fn stat(&self, ctx: &OpContext, path: &str) -> VfsResult<FileAttr>;

    /// Child entries sorted by name.
    async fn readdir(&self, ctx: &OpContext, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Open a file or directory.
    async fn open_file(&self, ctx: &OpContext, path: &str, flags: OpenFlags)
    -> VfsResult<FileHandle>;

    /// Capture the subtree at `path`.
    async fn snapshot(&self, ctx: &OpContext, path: &str) -> VfsResult<Snapshot>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Create a directory. The parent must exist.
    async fn mkdir(&self, ctx: &OpContext, path: &str) -> VfsResult<()>;

    /// Move a node within one collection.
    async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> VfsResult<()>;

    /// Remove one file or empty directory.
    async fn remove(&self, ctx: &OpContext, path: &str) -> VfsResult<()>;

    /// Remove a subtree. An absent path under an existing parent is not an error.
    async fn remove_all(&self, ctx: &OpContext, path: &str) -> VfsResult<()>;

    /// Graft a copy of `snapshot` at `path`, replacing whatever is there.
    async fn splice(&self, ctx: &OpContext, path: &str, snapshot: &Snapshot) -> VfsResult<()>;

    /// Make all pending changes durable.
    async fn sync(&self, ctx: &OpContext) -> VfsResult<()>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Returns true if this filesystem rejects every mutation.
    fn read_only(&self) -> bool;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, ctx: &OpContext, path: &str) -> bool {
        self.stat(ctx, path).await.is_ok()
    }

    /// Open for reading.
    async fn open(&self, ctx: &OpContext, path: &str) -> VfsResult<FileHandle> {
        self.open_file(ctx, path, OpenFlags::read()).await
    }

    /// Read entire file contents.
    async fn read_all(&self, ctx: &OpContext, path: &str) -> VfsResult<Vec<u8>> {
        let handle = self.open(ctx, path).await?;
        if handle.is_dir() {
            return Err(VfsError::is_a_directory(path));
        }
        handle.read_to_end(ctx).await
    }

    /// Create or truncate `path` and write `data` to it.
    async fn write_all(&self, ctx: &OpContext, path: &str, data: &[u8]) -> VfsResult<()> {
        let mut handle = self
            .open_file(ctx, path, OpenFlags::create_truncate())
            .await?;
        handle.write(data)?;
        handle.close()
    }
}
