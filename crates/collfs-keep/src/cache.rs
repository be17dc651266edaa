//! Shared read-only block cache.
//!
//! Blocks are keyed by their unsigned locator, so the same bytes fetched
//! through differently signed locators land in one entry. Entries are
//! verified against the locator before insertion; the cache never hands
//! out bytes that do not hash to the requested key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::KeepResult;
use crate::locator::Locator;

/// Default maximum cached blocks.
pub const DEFAULT_MAX_BLOCKS: usize = 256;

struct CachedBlock {
    data: Arc<Vec<u8>>,
    last_access: Instant,
}

/// LRU cache of immutable blocks.
pub struct BlockCache {
    blocks: RwLock<HashMap<Locator, CachedBlock>>,
    max_blocks: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            max_blocks: max_blocks.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a block, refreshing its LRU position.
    pub fn get(&self, locator: &Locator) -> Option<Arc<Vec<u8>>> {
        let key = locator.unsigned();
        let mut blocks = self.blocks.write();
        match blocks.get_mut(&key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(locator = %key, "block cache hit");
                Some(entry.data.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Verify and insert a block. Returns the shared bytes.
    pub fn insert(&self, locator: &Locator, data: Vec<u8>) -> KeepResult<Arc<Vec<u8>>> {
        locator.check(&data)?;
        let data = Arc::new(data);
        let mut blocks = self.blocks.write();
        self.evict_if_needed(&mut blocks);
        blocks.insert(
            locator.unsigned(),
            CachedBlock {
                data: data.clone(),
                last_access: Instant::now(),
            },
        );
        Ok(data)
    }

    /// Drop one block.
    pub fn remove(&self, locator: &Locator) {
        self.blocks.write().remove(&locator.unsigned());
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn evict_if_needed(&self, blocks: &mut HashMap<Locator, CachedBlock>) {
        while blocks.len() >= self.max_blocks {
            let oldest = blocks
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    tracing::trace!(locator = %key, "evicting cached block");
                    blocks.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeepError;
    use crate::locator::Signature;

    #[test]
    fn test_insert_get() {
        let cache = BlockCache::new(4);
        let loc = Locator::for_data(b"abc");
        assert!(cache.get(&loc).is_none());
        cache.insert(&loc, b"abc".to_vec()).unwrap();
        assert_eq!(cache.get(&loc).unwrap().as_slice(), b"abc");
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_signed_and_unsigned_share_entry() {
        let cache = BlockCache::new(4);
        let loc = Locator::for_data(b"abc");
        let signed = loc.clone().with_signature(Signature {
            mac: [1; 32],
            expires_at: 99,
        });
        cache.insert(&signed, b"abc".to_vec()).unwrap();
        assert!(cache.get(&loc).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejects_wrong_bytes() {
        let cache = BlockCache::new(4);
        let loc = Locator::for_data(b"abc");
        let err = cache.insert(&loc, b"abd".to_vec()).unwrap_err();
        assert!(matches!(err, KeepError::HashMismatch { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = BlockCache::new(2);
        let a = Locator::for_data(b"a");
        let b = Locator::for_data(b"b");
        let c = Locator::for_data(b"c");
        cache.insert(&a, b"a".to_vec()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(&b, b"b".to_vec()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        // Touch a so b is the oldest.
        cache.get(&a);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(&c, b"c".to_vec()).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
    }
}
