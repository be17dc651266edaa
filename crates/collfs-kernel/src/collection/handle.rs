//! Open file and directory handles.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use super::Inner;
use super::node::{FileCell, Segment};
use crate::context::OpContext;
use crate::vfs::{DirEntry, FileAttr, OpenFlags, VPath, VfsError, VfsResult};

enum Target {
    File { fs: Arc<Inner>, cell: Arc<FileCell> },
    Dir { fs: Arc<Inner> },
    /// A metadata-only directory listed at open time.
    Listing(Vec<DirEntry>),
}

/// An open file or directory.
///
/// A file handle keeps the file it resolved to even if the file is later
/// renamed or removed. Each `write_at` is applied atomically under the
/// file's lock. Cursor methods take `&mut self`, so one handle cannot be
/// written through concurrently.
pub struct FileHandle {
    target: Target,
    path: VPath,
    flags: OpenFlags,
    pos: u64,
    closed: bool,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path.to_string())
            .field("flags", &self.flags)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    pub(super) fn file(fs: Arc<Inner>, cell: Arc<FileCell>, path: VPath, flags: OpenFlags) -> Self {
        Self::new(Target::File { fs, cell }, path, flags)
    }

    pub(super) fn dir(fs: Arc<Inner>, path: VPath, flags: OpenFlags) -> Self {
        Self::new(Target::Dir { fs }, path, flags)
    }

    pub(crate) fn listing(path: VPath, entries: Vec<DirEntry>) -> Self {
        Self::new(Target::Listing(entries), path, OpenFlags::read())
    }

    fn new(target: Target, path: VPath, flags: OpenFlags) -> Self {
        Self {
            target,
            path,
            flags,
            pos: 0,
            closed: false,
        }
    }

    pub fn path(&self) -> &VPath {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_dir(&self) -> bool {
        !matches!(self.target, Target::File { .. })
    }

    /// Cursor position for `read`/`write`.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::invalid_argument(format!("{}: handle is closed", self.path)))
        } else {
            Ok(())
        }
    }

    fn file_cell(&self) -> VfsResult<(&Arc<Inner>, &Arc<FileCell>)> {
        self.check_open()?;
        match &self.target {
            Target::File { fs, cell } => Ok((fs, cell)),
            _ => Err(VfsError::is_a_directory(self.path.to_string())),
        }
    }

    fn writable_cell(&self) -> VfsResult<(&Arc<Inner>, &Arc<FileCell>)> {
        let (fs, cell) = self.file_cell()?;
        if !self.flags.write {
            return Err(VfsError::permission_denied(format!(
                "{}: not open for writing",
                self.path
            )));
        }
        Ok((fs, cell))
    }

    pub fn stat(&self) -> VfsResult<FileAttr> {
        self.check_open()?;
        match &self.target {
            Target::File { cell, .. } => Ok(cell.read().attr()),
            Target::Dir { fs, .. } => {
                let tree = fs.tree.read();
                Ok(FileAttr::directory(tree.dir(self.path.components())?.mtime()))
            }
            Target::Listing(_) => Ok(FileAttr::directory(SystemTime::now())),
        }
    }

    /// Entries of an open directory. Each call lists afresh.
    pub fn readdir(&self) -> VfsResult<Vec<DirEntry>> {
        self.check_open()?;
        match &self.target {
            Target::Dir { fs } => Ok(fs.tree.read().dir(self.path.components())?.entries()),
            Target::Listing(entries) => Ok(entries.clone()),
            Target::File { .. } => Err(VfsError::not_a_directory(self.path.to_string())),
        }
    }

    /// Read up to `len` bytes at `offset`. Short at end of file.
    pub async fn read_at(&self, ctx: &OpContext, offset: u64, len: usize) -> VfsResult<Vec<u8>> {
        let (fs, cell) = self.file_cell()?;
        if !self.flags.read {
            return Err(VfsError::permission_denied(format!(
                "{}: not open for reading",
                self.path
            )));
        }
        let segments = cell.read().range(offset, len as u64);
        let total: u64 = segments.iter().map(Segment::len).sum();
        let mut out = Vec::with_capacity(total as usize);
        for seg in segments {
            match seg {
                Segment::Memory { buf, offset, len } => {
                    out.extend_from_slice(&buf[offset..offset + len]);
                }
                Segment::Zero { len } => out.resize(out.len() + len as usize, 0),
                Segment::Stored {
                    locator,
                    offset,
                    len,
                } => {
                    let block = fs.backend.fetch_block(ctx, &locator).await?;
                    let bytes = block
                        .get(offset as usize..(offset + len) as usize)
                        .ok_or_else(|| {
                            VfsError::other(format!(
                                "block {} is shorter than the manifest claims",
                                locator.unsigned()
                            ))
                        })?;
                    out.extend_from_slice(bytes);
                }
            }
        }
        Ok(out)
    }

    /// Write `data` at `offset`, or at end of file in append mode.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        self.write_inner(offset, data).map(|_| data.len())
    }

    /// Returns the offset just past the written data.
    fn write_inner(&self, offset: u64, data: &[u8]) -> VfsResult<u64> {
        let (fs, cell) = self.writable_cell()?;
        let mut file = cell.write();
        let offset = if self.flags.append { file.size() } else { offset };
        file.write(offset, data)?;
        fs.touch();
        Ok(offset + data.len() as u64)
    }

    /// Read from the cursor.
    pub async fn read(&mut self, ctx: &OpContext, len: usize) -> VfsResult<Vec<u8>> {
        let data = self.read_at(ctx, self.pos, len).await?;
        self.pos += data.len() as u64;
        Ok(data)
    }

    /// Write at the cursor and advance it.
    pub fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.pos = self.write_inner(self.pos, data)?;
        Ok(data.len())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let (_, cell) = self.file_cell()?;
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => cell.read().size().checked_add_signed(d),
        };
        self.pos = target.ok_or_else(|| {
            VfsError::invalid_argument(format!("{}: seek before start of file", self.path))
        })?;
        Ok(self.pos)
    }

    /// The whole file.
    pub async fn read_to_end(&self, ctx: &OpContext) -> VfsResult<Vec<u8>> {
        let (_, cell) = self.file_cell()?;
        let size = cell.read().size();
        self.read_at(ctx, 0, size as usize).await
    }

    /// Cut or zero-extend the file.
    pub fn truncate(&self, size: u64) -> VfsResult<()> {
        let (fs, cell) = self.writable_cell()?;
        cell.write().truncate(size)?;
        fs.touch();
        Ok(())
    }

    /// Further calls fail. Data stays pending until the filesystem syncs.
    pub fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}
