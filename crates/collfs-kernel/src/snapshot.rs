//! Detached subtree copies.
//!
//! A [`Snapshot`] records structure and file segment lists at the instant of
//! capture. It holds no reference into the live tree: segments name
//! immutable blocks or shared read-only buffers, so a snapshot can be
//! spliced any number of times, into any collection, and each copy evolves
//! independently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::collection::node::{DirNode, FileData, Node, Segment, new_file_cell};

/// A detached node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapNode {
    File {
        segments: Vec<Segment>,
        mtime: SystemTime,
    },
    Dir {
        children: BTreeMap<String, SnapNode>,
        mtime: SystemTime,
    },
}

impl SnapNode {
    pub fn empty_dir(mtime: SystemTime) -> Self {
        SnapNode::Dir {
            children: BTreeMap::new(),
            mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, SnapNode::Dir { .. })
    }

    /// Total bytes of file content in the subtree.
    pub fn size(&self) -> u64 {
        match self {
            SnapNode::File { segments, .. } => segments.iter().map(Segment::len).sum(),
            SnapNode::Dir { children, .. } => children.values().map(SnapNode::size).sum(),
        }
    }

    /// Copy a live node. Takes each file's lock briefly.
    pub(crate) fn capture(node: &Node) -> Self {
        match node {
            Node::File(cell) => {
                let data = cell.read();
                SnapNode::File {
                    segments: data.segments().to_vec(),
                    mtime: data.mtime(),
                }
            }
            Node::Dir(dir) => Self::capture_dir(dir),
        }
    }

    pub(crate) fn capture_dir(dir: &DirNode) -> Self {
        SnapNode::Dir {
            children: dir
                .children()
                .iter()
                .map(|(name, child)| (name.clone(), Self::capture(child)))
                .collect(),
            mtime: dir.mtime(),
        }
    }

    /// Build fresh live nodes sharing this snapshot's segments.
    pub(crate) fn materialize(&self, debug_locks: bool) -> Node {
        match self {
            SnapNode::File { segments, mtime } => Node::File(new_file_cell(
                debug_locks,
                FileData::from_segments(segments.clone(), *mtime),
            )),
            SnapNode::Dir { .. } => Node::Dir(self.materialize_dir(debug_locks)),
        }
    }

    /// Like [`materialize`](Self::materialize) for a directory. A file
    /// snapshot yields an empty directory.
    pub(crate) fn materialize_dir(&self, debug_locks: bool) -> DirNode {
        match self {
            SnapNode::Dir { children, mtime } => {
                let mut dir = DirNode::new(*mtime);
                for (name, child) in children {
                    dir.insert(name.clone(), child.materialize(debug_locks));
                }
                dir
            }
            SnapNode::File { mtime, .. } => DirNode::new(*mtime),
        }
    }

    /// Segment list of the file at `comps`, for rewriting in place.
    pub(crate) fn file_segments_mut(&mut self, comps: &[String]) -> Option<&mut Vec<Segment>> {
        let mut node = self;
        for name in comps {
            node = match node {
                SnapNode::Dir { children, .. } => children.get_mut(name)?,
                SnapNode::File { .. } => return None,
            };
        }
        match node {
            SnapNode::File { segments, .. } => Some(segments),
            SnapNode::Dir { .. } => None,
        }
    }
}

/// An immutable captured subtree. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: Arc<SnapNode>,
}

impl Snapshot {
    pub fn new(root: SnapNode) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    pub fn node(&self) -> &SnapNode {
        &self.root
    }

    pub fn is_dir(&self) -> bool {
        self.root.is_dir()
    }

    /// Total bytes referenced.
    pub fn size(&self) -> u64 {
        self.root.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> DirNode {
        let mut root = DirNode::default();
        let mut sub = DirNode::default();
        let mut data = FileData::new(SystemTime::now());
        data.write(0, b"hello").unwrap();
        sub.insert("f".into(), Node::File(new_file_cell(false, data)));
        root.insert("sub".into(), Node::Dir(sub));
        root.insert("empty".into(), Node::Dir(DirNode::default()));
        root
    }

    #[test]
    fn test_capture_is_detached() {
        let root = tree();
        let snap = Snapshot::new(SnapNode::capture_dir(&root));
        assert_eq!(snap.size(), 5);

        // Writing the source afterwards does not reach the snapshot.
        let comps = vec!["sub".to_string(), "f".to_string()];
        if let Some(Node::File(cell)) = root.lookup(&comps) {
            cell.write().write(5, b" world").unwrap();
        }
        assert_eq!(snap.size(), 5);
    }

    #[test]
    fn test_materialize_twice_gives_independent_copies() {
        let snap = Snapshot::new(SnapNode::capture_dir(&tree()));
        let a = snap.node().materialize_dir(false);
        let b = snap.node().materialize_dir(false);
        let comps = vec!["sub".to_string(), "f".to_string()];
        let (Some(Node::File(fa)), Some(Node::File(fb))) = (a.lookup(&comps), b.lookup(&comps))
        else {
            panic!("file missing from copy");
        };
        assert!(!Arc::ptr_eq(fa, fb));
        fa.write().truncate(1).unwrap();
        assert_eq!(fb.read().size(), 5);
        assert!(a.child("empty").is_some());
    }

    #[test]
    fn test_file_segments_mut() {
        let mut snap = SnapNode::capture_dir(&tree());
        let comps = vec!["sub".to_string(), "f".to_string()];
        let segs = snap.file_segments_mut(&comps).unwrap();
        segs.clear();
        assert_eq!(snap.size(), 0);
        assert!(snap.file_segments_mut(&["sub".to_string()]).is_none());
        assert!(snap.file_segments_mut(&["nope".to_string()]).is_none());
    }
}
