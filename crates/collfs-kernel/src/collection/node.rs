//! In-memory tree of one collection.
//!
//! Directories own their children outright; there are no parent links,
//! the tree is always addressed from the root. A file's contents are an
//! ordered list of [`Segment`]s, each a byte range of a stored block, an
//! in-memory buffer, or a run of zeros left by writing past end of file. Segments are never mutated once another list
//! shares them: writes replace segments, and the only in-place change is
//! appending to a buffer nobody else references.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use collfs_keep::Locator;

use crate::lock::{LockLevel, OrderedRwLock};
use crate::vfs::{DirEntry, FileAttr, FileType, VfsError, VfsResult, path};

/// A byte range of file content.
#[derive(Clone, PartialEq, Eq)]
pub enum Segment {
    /// Range of a block already durable in the backing store.
    Stored {
        locator: Locator,
        offset: u64,
        len: u64,
    },
    /// Range of a buffer written since the last sync.
    Memory {
        buf: Arc<Vec<u8>>,
        offset: usize,
        len: usize,
    },
    /// Zeros filling a gap; materialized only when read or synced.
    Zero { len: u64 },
}

/// Largest file size; offsets past it cannot be expressed to POSIX callers.
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Stored {
                locator,
                offset,
                len,
            } => write!(f, "Stored({}, {}+{})", locator.unsigned(), offset, len),
            Segment::Memory { offset, len, .. } => write!(f, "Memory({}+{})", offset, len),
            Segment::Zero { len } => write!(f, "Zero({})", len),
        }
    }
}

impl Segment {
    pub fn memory(data: Vec<u8>) -> Self {
        let len = data.len();
        Segment::Memory {
            buf: Arc::new(data),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Segment::Stored { len, .. } => *len,
            Segment::Memory { len, .. } => *len as u64,
            Segment::Zero { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Segment::Stored { .. })
    }

    /// The sub-range `[start, start + len)` of this segment.
    pub fn slice(&self, start: u64, len: u64) -> Segment {
        debug_assert!(start + len <= self.len());
        match self {
            Segment::Stored {
                locator, offset, ..
            } => Segment::Stored {
                locator: locator.clone(),
                offset: offset + start,
                len,
            },
            Segment::Memory { buf, offset, .. } => Segment::Memory {
                buf: buf.clone(),
                offset: offset + start as usize,
                len: len as usize,
            },
            Segment::Zero { .. } => Segment::Zero { len },
        }
    }
}

/// Content and metadata of one file.
#[derive(Debug, Clone)]
pub struct FileData {
    segments: Vec<Segment>,
    size: u64,
    mtime: SystemTime,
    /// Bumped on every content change; sync uses it to detect writes that
    /// raced with an upload.
    generation: u64,
}

impl FileData {
    pub fn new(mtime: SystemTime) -> Self {
        Self {
            segments: Vec::new(),
            size: 0,
            mtime,
            generation: 0,
        }
    }

    pub fn from_segments(segments: Vec<Segment>, mtime: SystemTime) -> Self {
        let segments: Vec<Segment> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        let size = segments.iter().map(Segment::len).sum();
        Self {
            segments,
            size,
            mtime,
            generation: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr::file(self.size, self.mtime)
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.mtime = SystemTime::now();
    }

    /// Segments covering `[start, start + len)`, clamped to end of file.
    pub fn range(&self, start: u64, len: u64) -> Vec<Segment> {
        let end = start.saturating_add(len).min(self.size);
        let mut out = Vec::new();
        let mut pos = 0u64;
        for seg in &self.segments {
            let seg_end = pos + seg.len();
            if seg_end > start && pos < end {
                let from = start.max(pos);
                let to = end.min(seg_end);
                out.push(seg.slice(from - pos, to - from));
            }
            if seg_end >= end {
                break;
            }
            pos = seg_end;
        }
        out
    }

    /// Write `data` at `offset`, zero-filling any gap past end of file.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or_else(|| {
                VfsError::invalid_argument(format!(
                    "write of {} bytes at offset {} exceeds the maximum file size",
                    data.len(),
                    offset
                ))
            })?;
        if offset > self.size {
            self.extend_zeros(offset - self.size);
        }
        if offset == self.size {
            self.append(data);
        } else {
            let mut segments = self.range(0, offset);
            segments.push(Segment::memory(data.to_vec()));
            if end < self.size {
                segments.extend(self.range(end, self.size - end));
            }
            self.segments = segments;
            self.size = self.size.max(end);
        }
        self.touch();
        Ok(())
    }

    fn extend_zeros(&mut self, n: u64) {
        self.size += n;
        if let Some(Segment::Zero { len }) = self.segments.last_mut() {
            *len += n;
        } else {
            self.segments.push(Segment::Zero { len: n });
        }
    }

    fn append(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        if let Some(Segment::Memory { buf, offset, len }) = self.segments.last_mut() {
            if *offset + *len == buf.len() {
                if let Some(owned) = Arc::get_mut(buf) {
                    owned.extend_from_slice(data);
                    *len += data.len();
                    return;
                }
            }
        }
        self.segments.push(Segment::memory(data.to_vec()));
    }

    /// Cut or zero-extend to `size`.
    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if size > MAX_FILE_SIZE {
            return Err(VfsError::invalid_argument(format!(
                "cannot truncate to {} bytes: exceeds the maximum file size",
                size
            )));
        }
        if size < self.size {
            self.segments = self.range(0, size);
            self.size = size;
        } else if size > self.size {
            self.extend_zeros(size - self.size);
        }
        self.touch();
        Ok(())
    }

    /// Replace stale signatures on stored segments. Content is unchanged,
    /// so the generation is not bumped.
    pub(crate) fn refresh_locators(&mut self, fresh: &HashMap<Locator, Locator>) {
        super::sync::replace_locators(&mut self.segments, fresh);
    }

    /// Swap in stored segments produced by a sync of this exact generation.
    pub(crate) fn commit_segments(&mut self, generation: u64, segments: Vec<Segment>) -> bool {
        if self.generation != generation {
            return false;
        }
        debug_assert_eq!(segments.iter().map(Segment::len).sum::<u64>(), self.size);
        self.segments = segments;
        true
    }
}

/// Lock-protected file content, shared between the tree and open handles.
pub type FileCell = OrderedRwLock<FileData>;

pub(crate) fn new_file_cell(debug_locks: bool, data: FileData) -> Arc<FileCell> {
    Arc::new(OrderedRwLock::new(LockLevel::File, debug_locks, data))
}

/// A tree node.
#[derive(Debug)]
pub enum Node {
    File(Arc<FileCell>),
    Dir(DirNode),
}

impl Node {
    pub fn kind(&self) -> FileType {
        match self {
            Node::File(_) => FileType::File,
            Node::Dir(_) => FileType::Directory,
        }
    }

    /// Takes the file lock for files.
    pub fn attr(&self) -> FileAttr {
        match self {
            Node::File(cell) => cell.read().attr(),
            Node::Dir(dir) => FileAttr::directory(dir.mtime),
        }
    }
}

/// A directory and its children.
#[derive(Debug)]
pub struct DirNode {
    children: BTreeMap<String, Node>,
    mtime: SystemTime,
}

impl Default for DirNode {
    fn default() -> Self {
        Self::new(SystemTime::now())
    }
}

impl DirNode {
    pub fn new(mtime: SystemTime) -> Self {
        Self {
            children: BTreeMap::new(),
            mtime,
        }
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    pub fn children(&self) -> &BTreeMap<String, Node> {
        &self.children
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// Insert or replace a child. Returns the displaced node.
    pub fn insert(&mut self, name: String, node: Node) -> Option<Node> {
        self.mtime = SystemTime::now();
        self.children.insert(name, node)
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        let removed = self.children.remove(name);
        if removed.is_some() {
            self.mtime = SystemTime::now();
        }
        removed
    }

    /// Replace all children.
    pub fn replace_children(&mut self, other: DirNode) {
        self.children = other.children;
        self.mtime = SystemTime::now();
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> Vec<DirEntry> {
        self.children
            .iter()
            .map(|(name, node)| DirEntry::new(name.clone(), node.kind()))
            .collect()
    }

    /// Node at `comps`, if any.
    pub fn lookup(&self, comps: &[String]) -> Option<&Node> {
        let (last, parents) = comps.split_last()?;
        let mut dir = self;
        for name in parents {
            match dir.children.get(name) {
                Some(Node::Dir(d)) => dir = d,
                _ => return None,
            }
        }
        dir.children.get(last)
    }

    /// Directory at `comps`.
    pub fn dir(&self, comps: &[String]) -> VfsResult<&DirNode> {
        let mut dir = self;
        for (i, name) in comps.iter().enumerate() {
            dir = match dir.children.get(name) {
                Some(Node::Dir(d)) => d,
                Some(Node::File(_)) => {
                    return Err(VfsError::not_a_directory(path::display(&comps[..=i])));
                }
                None => return Err(VfsError::not_found(path::display(&comps[..=i]))),
            };
        }
        Ok(dir)
    }

    /// Mutable directory at `comps`.
    pub fn dir_mut(&mut self, comps: &[String]) -> VfsResult<&mut DirNode> {
        let mut dir = self;
        for (i, name) in comps.iter().enumerate() {
            dir = match dir.children.get_mut(name) {
                Some(Node::Dir(d)) => d,
                Some(Node::File(_)) => {
                    return Err(VfsError::not_a_directory(path::display(&comps[..=i])));
                }
                None => return Err(VfsError::not_found(path::display(&comps[..=i]))),
            };
        }
        Ok(dir)
    }
}
