//! Persisting a collection: pack pending buffers into blocks, upload them,
//! commit the manifest.
//!
//! Nothing in the live tree changes until the commit succeeds. Then each
//! file's pending segments are swapped for stored ones, but only if the
//! file's generation is unchanged since capture; files written during the
//! sync keep their pending data and the filesystem stays dirty.
//!
//! Stored locators carried over from the last commit are re-signed when
//! their signatures have lapsed. If the backend still rejects the manifest
//! as expired, every stored locator is re-signed and the commit retried
//! once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use collfs_keep::Locator;
use futures::future::try_join_all;

use super::node::{DirNode, FileCell, Node, Segment};
use super::CollectionFs;
use crate::context::OpContext;
use crate::manifest::Manifest;
use crate::snapshot::SnapNode;
use crate::vfs::{VfsError, VfsResult};

/// A file with pending data, as captured.
struct PendingFile {
    path: Vec<String>,
    cell: Arc<FileCell>,
    generation: u64,
}

/// Where each pending segment lands: (block index, offset in block, len).
type Placement = Vec<(usize, u64, u64)>;

enum Planned {
    Keep(Segment),
    Packed(Placement),
}

/// Accumulates pending bytes into blocks of at most `block_size`.
struct Packer {
    block_size: usize,
    current: Vec<u8>,
    blocks: Vec<Vec<u8>>,
}

impl Packer {
    fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            current: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn push(&mut self, mut data: &[u8]) -> Placement {
        let mut placement = Vec::new();
        while !data.is_empty() {
            if self.current.len() == self.block_size {
                self.blocks.push(std::mem::take(&mut self.current));
            }
            let take = (self.block_size - self.current.len()).min(data.len());
            placement.push((self.blocks.len(), self.current.len() as u64, take as u64));
            self.current.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        placement
    }

    fn push_zeros(&mut self, mut len: u64) -> Placement {
        let mut placement = Vec::new();
        while len > 0 {
            if self.current.len() == self.block_size {
                self.blocks.push(std::mem::take(&mut self.current));
            }
            let room = (self.block_size - self.current.len()) as u64;
            let take = room.min(len);
            placement.push((self.blocks.len(), self.current.len() as u64, take));
            self.current.resize(self.current.len() + take as usize, 0);
            len -= take;
        }
        placement
    }

    fn finish(mut self) -> Vec<Vec<u8>> {
        if !self.current.is_empty() {
            self.blocks.push(self.current);
        }
        self.blocks
    }
}

/// Unsigned keys of every non-empty stored block the tree references.
fn stored_blocks(node: &SnapNode, out: &mut HashSet<Locator>) {
    match node {
        SnapNode::File { segments, .. } => {
            for seg in segments {
                if let Segment::Stored { locator, .. } = seg {
                    if locator.size() > 0 {
                        out.insert(locator.unsigned());
                    }
                }
            }
        }
        SnapNode::Dir { children, .. } => {
            for child in children.values() {
                stored_blocks(child, out);
            }
        }
    }
}

/// Swap in fresh signatures, keyed by unsigned locator.
pub(super) fn replace_locators(segments: &mut [Segment], fresh: &HashMap<Locator, Locator>) {
    for seg in segments {
        if let Segment::Stored { locator, .. } = seg {
            if let Some(new) = fresh.get(&locator.unsigned()) {
                *locator = new.clone();
            }
        }
    }
}

fn replace_tree_locators(node: &mut SnapNode, fresh: &HashMap<Locator, Locator>) {
    match node {
        SnapNode::File { segments, .. } => replace_locators(segments, fresh),
        SnapNode::Dir { children, .. } => {
            for child in children.values_mut() {
                replace_tree_locators(child, fresh);
            }
        }
    }
}

fn refresh_live_dir(dir: &DirNode, fresh: &HashMap<Locator, Locator>) {
    for child in dir.children().values() {
        match child {
            Node::Dir(d) => refresh_live_dir(d, fresh),
            Node::File(cell) => cell.write().refresh_locators(fresh),
        }
    }
}

fn capture_dir(dir: &DirNode, path: &mut Vec<String>, pending: &mut Vec<PendingFile>) -> SnapNode {
    let mut children = std::collections::BTreeMap::new();
    for (name, child) in dir.children() {
        path.push(name.clone());
        let node = match child {
            Node::Dir(d) => capture_dir(d, path, pending),
            Node::File(cell) => {
                let data = cell.read();
                if data.segments().iter().any(|s| !s.is_stored()) {
                    pending.push(PendingFile {
                        path: path.clone(),
                        cell: cell.clone(),
                        generation: data.generation(),
                    });
                }
                SnapNode::File {
                    segments: data.segments().to_vec(),
                    mtime: data.mtime(),
                }
            }
        };
        path.pop();
        children.insert(name.clone(), node);
    }
    SnapNode::Dir {
        children,
        mtime: dir.mtime(),
    }
}

impl CollectionFs {
    /// Make all changes durable.
    ///
    /// A no-op when clean. On failure nothing is committed and the
    /// filesystem stays dirty; blocks already uploaded are not referenced
    /// by any committed manifest.
    pub async fn sync(&self, ctx: &OpContext) -> VfsResult<()> {
        if self.inner.read_only || !self.is_dirty() {
            return Ok(());
        }
        let _sync = self.inner.sync_lock.lock().await;
        if !self.is_dirty() {
            return Ok(());
        }
        match self.sync_locked(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(collection = %self.inner.id, error = %e, "sync failed");
                Err(e)
            }
        }
    }

    async fn sync_locked(&self, ctx: &OpContext) -> VfsResult<()> {
        let inner = &self.inner;
        let (mut tree, pending, seq) = {
            let root = inner.tree.read();
            let seq = inner.mutations.load(Ordering::SeqCst);
            let mut pending = Vec::new();
            let tree = capture_dir(&root, &mut Vec::new(), &mut pending);
            (tree, pending, seq)
        };
        let classes = self.storage_classes();

        let mut packer = Packer::new(inner.config.block_size);
        let mut plans: Vec<Vec<Planned>> = Vec::with_capacity(pending.len());
        for file in &pending {
            let segments = tree
                .file_segments_mut(&file.path)
                .ok_or_else(|| VfsError::other("captured file vanished"))?;
            let plan = segments
                .iter()
                .map(|seg| match seg {
                    Segment::Memory { buf, offset, len } => {
                        Planned::Packed(packer.push(&buf[*offset..*offset + *len]))
                    }
                    Segment::Zero { len } => Planned::Packed(packer.push_zeros(*len)),
                    stored => Planned::Keep(stored.clone()),
                })
                .collect();
            plans.push(plan);
        }
        let blocks = packer.finish();

        let locators = try_join_all(blocks.iter().map(|data| self.upload(ctx, data, &classes)))
            .await?;

        let mut rewritten = Vec::with_capacity(pending.len());
        for (file, plan) in pending.iter().zip(plans) {
            let segments: Vec<Segment> = plan
                .into_iter()
                .flat_map(|p| match p {
                    Planned::Keep(seg) => vec![seg],
                    Planned::Packed(placement) => placement
                        .into_iter()
                        .map(|(block, offset, len)| Segment::Stored {
                            locator: locators[block].clone(),
                            offset,
                            len,
                        })
                        .collect(),
                })
                .collect();
            if let Some(slot) = tree.file_segments_mut(&file.path) {
                *slot = segments.clone();
            }
            rewritten.push(segments);
        }

        let uuid = inner
            .state
            .lock()
            .record
            .uuid
            .clone()
            .ok_or(VfsError::ReadOnly)?;

        let mut fresh = self.refresh_signatures(ctx, &mut tree, false).await?;
        let record = match self.commit(ctx, &uuid, &tree, &classes).await {
            Err(VfsError::Expired(msg)) => {
                tracing::debug!(collection = %inner.id, locator = %msg, "commit rejected an expired signature, re-signing");
                fresh.extend(self.refresh_signatures(ctx, &mut tree, true).await?);
                self.commit(ctx, &uuid, &tree, &classes).await?
            }
            other => other?,
        };

        let mut kept = 0usize;
        for (file, mut segments) in pending.iter().zip(rewritten) {
            replace_locators(&mut segments, &fresh);
            if !file.cell.write().commit_segments(file.generation, segments) {
                kept += 1;
            }
        }
        if !fresh.is_empty() {
            refresh_live_dir(&inner.tree.read(), &fresh);
        }
        tracing::info!(
            collection = %inner.id,
            pdh = %record.portable_data_hash,
            blocks = blocks.len(),
            files_changed_during_sync = kept,
            "committed manifest"
        );
        inner.state.lock().record = record;
        inner.committed.store(seq, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(
        &self,
        ctx: &OpContext,
        uuid: &str,
        tree: &SnapNode,
        classes: &[String],
    ) -> VfsResult<collfs_types::CollectionRecord> {
        let text = Manifest::from_snapshot(tree)?.to_string();
        let api = self.inner.backend.api();
        self.inner
            .backend
            .call(ctx, api.commit_manifest(uuid, &text, classes))
            .await
    }

    /// Re-sign the stored blocks `tree` references: those whose signature
    /// has lapsed, or all of them with `force`. Rewrites `tree` and returns
    /// the replacements made.
    async fn refresh_signatures(
        &self,
        ctx: &OpContext,
        tree: &mut SnapNode,
        force: bool,
    ) -> VfsResult<HashMap<Locator, Locator>> {
        let mut keys = HashSet::new();
        stored_blocks(tree, &mut keys);
        let mut signed = Vec::with_capacity(keys.len());
        for key in keys {
            let current = first_locator(tree, &key).unwrap_or_else(|| key.clone());
            let locator = self.inner.backend.fresh_locator(ctx, &current, force).await?;
            if locator != current {
                signed.push((key, locator));
            }
        }
        let fresh: HashMap<Locator, Locator> = signed.into_iter().collect();
        if !fresh.is_empty() {
            tracing::debug!(collection = %self.inner.id, count = fresh.len(), "re-signed stored locators");
            replace_tree_locators(tree, &fresh);
        }
        Ok(fresh)
    }

    /// Store one block and check that every desired class was confirmed.
    async fn upload(&self, ctx: &OpContext, data: &[u8], classes: &[String]) -> VfsResult<Locator> {
        let backend = &self.inner.backend;
        let receipt = backend
            .call(ctx, backend.keep().put_block(data, classes))
            .await?;
        receipt.locator.check(data)?;
        let missing = receipt.missing_classes(classes);
        if !missing.is_empty() {
            let named: Vec<String> = missing
                .iter()
                .map(|c| format!("storage class {:?}", c))
                .collect();
            tracing::warn!(
                collection = %self.inner.id,
                locator = %receipt.locator.unsigned(),
                missing = ?missing,
                "backend did not confirm storage classes"
            );
            return Err(VfsError::StorageClassUnsatisfiable(format!(
                "{} not confirmed for block {}",
                named.join(", "),
                receipt.locator.unsigned()
            )));
        }
        tracing::debug!(locator = %receipt.locator.unsigned(), "uploaded block");
        Ok(receipt.locator)
    }
}

/// The locator, as held in the tree, for the block keyed by `key`.
fn first_locator(node: &SnapNode, key: &Locator) -> Option<Locator> {
    match node {
        SnapNode::File { segments, .. } => segments.iter().find_map(|seg| match seg {
            Segment::Stored { locator, .. } if &locator.unsigned() == key => Some(locator.clone()),
            _ => None,
        }),
        SnapNode::Dir { children, .. } => {
            children.values().find_map(|child| first_locator(child, key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packer_splits_at_block_size() {
        let mut p = Packer::new(4);
        assert_eq!(p.push(b"abc"), vec![(0, 0, 3)]);
        assert_eq!(p.push(b"defgh"), vec![(0, 3, 1), (1, 0, 4)]);
        assert_eq!(p.push(b"i"), vec![(2, 0, 1)]);
        let blocks = p.finish();
        assert_eq!(blocks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"i".to_vec()]);
    }

    #[test]
    fn test_packer_zero_block_size() {
        let mut p = Packer::new(0);
        assert_eq!(p.push(b"ab"), vec![(0, 0, 1), (1, 0, 1)]);
        assert_eq!(p.finish(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_packer_zeros_share_blocks() {
        let mut p = Packer::new(4);
        assert_eq!(p.push(b"ab"), vec![(0, 0, 2)]);
        assert_eq!(p.push_zeros(5), vec![(0, 2, 2), (1, 0, 3)]);
        assert_eq!(p.finish(), vec![b"ab\0\0".to_vec(), vec![0u8; 3]]);
    }

    #[test]
    fn test_packer_empty() {
        let mut p = Packer::new(4);
        assert!(p.push(b"").is_empty());
        assert!(p.finish().is_empty());
    }
}
