//! Cached, signature-aware block fetching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::BlockCache;
use crate::client::SharedKeepClient;
use crate::error::{KeepError, KeepResult};
use crate::locator::Locator;
use crate::signing::unix_now;

/// Upper bound on remembered re-signed locators.
const MAX_RESIGNED: usize = 4096;

/// Fetches blocks through a shared cache, re-signing stale locators.
///
/// A locator whose signature has expired is re-signed before the fetch.
/// If the backend still answers `Expired` (clock skew, revoked key), the
/// locator is re-signed and the fetch retried exactly once.
pub struct BlockReader {
    client: SharedKeepClient,
    cache: Arc<BlockCache>,
    token: String,
    ttl: Duration,
    timeout: Duration,
    /// Fresh signatures obtained by re-signing, keyed by unsigned locator.
    /// Expired entries are dropped; the map never exceeds `MAX_RESIGNED`.
    resigned: Mutex<HashMap<Locator, Locator>>,
}

impl BlockReader {
    pub fn new(
        client: SharedKeepClient,
        cache: Arc<BlockCache>,
        token: impl Into<String>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            token: token.into(),
            ttl,
            timeout,
            resigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn client(&self) -> &SharedKeepClient {
        &self.client
    }

    /// Per-call backend deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch a block, from cache when possible.
    pub async fn fetch(&self, locator: &Locator) -> KeepResult<Arc<Vec<u8>>> {
        if let Some(data) = self.cache.get(locator) {
            return Ok(data);
        }

        let mut current = self.best_locator(locator);
        if current.is_expired(unix_now()) {
            current = self.resign(&current).await?;
        }

        let data = match self.fetch_once(&current).await {
            Err(KeepError::Expired(_)) => {
                tracing::debug!(locator = %current.unsigned(), "fetch reported expired signature, retrying");
                let fresh = self.resign(&current).await?;
                self.fetch_once(&fresh).await?
            }
            other => other?,
        };

        self.cache.insert(locator, data)
    }

    /// A locator for the same block whose signature is still good by the
    /// local clock. Re-signs when it has expired, or always with `force`.
    pub async fn fresh_locator(&self, locator: &Locator, force: bool) -> KeepResult<Locator> {
        let current = self.best_locator(locator);
        if force || current.is_expired(unix_now()) {
            return self.resign(&current).await;
        }
        Ok(current)
    }

    fn best_locator(&self, locator: &Locator) -> Locator {
        let key = locator.unsigned();
        let mut resigned = self.resigned.lock();
        match resigned.get(&key) {
            Some(fresh) if !fresh.is_expired(unix_now()) => fresh.clone(),
            Some(_) => {
                resigned.remove(&key);
                locator.clone()
            }
            None => locator.clone(),
        }
    }

    /// Number of remembered re-signed locators.
    pub fn resigned_len(&self) -> usize {
        self.resigned.lock().len()
    }

    async fn fetch_once(&self, locator: &Locator) -> KeepResult<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.client.fetch_block(locator))
            .await
            .map_err(|_| KeepError::TimedOut)?
    }

    async fn resign(&self, locator: &Locator) -> KeepResult<Locator> {
        tracing::debug!(locator = %locator.unsigned(), "re-signing locator");
        let fresh = tokio::time::timeout(
            self.timeout,
            self.client.sign_locator(locator, &self.token, self.ttl),
        )
        .await
        .map_err(|_| KeepError::TimedOut)??;
        let mut resigned = self.resigned.lock();
        if resigned.len() >= MAX_RESIGNED {
            let now = unix_now();
            resigned.retain(|_, l| !l.is_expired(now));
        }
        if resigned.len() >= MAX_RESIGNED {
            // Entries are only a shortcut; any one can be re-obtained.
            if let Some(victim) = resigned.keys().next().cloned() {
                resigned.remove(&victim);
            }
        }
        resigned.insert(locator.unsigned(), fresh.clone());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiClient;
    use crate::memory::MemoryStore;

    fn reader(store: &Arc<MemoryStore>) -> BlockReader {
        BlockReader::new(
            store.clone(),
            Arc::new(BlockCache::new(16)),
            store.token(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_fetch_caches() {
        let store = Arc::new(MemoryStore::new());
        let loc = store.store_block(b"hello");
        let reader = reader(&store);

        assert_eq!(reader.fetch(&loc).await.unwrap().as_slice(), b"hello");
        assert_eq!(reader.fetch(&loc).await.unwrap().as_slice(), b"hello");
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_signature_is_resigned() {
        let store = Arc::new(MemoryStore::new());
        let loc = store.store_block(b"hello");
        // Store-side time moves past the signature's expiry.
        store.advance_clock(Duration::from_secs(30 * 24 * 3600));
        let reader = reader(&store);

        assert_eq!(reader.fetch(&loc).await.unwrap().as_slice(), b"hello");
        // One expired attempt plus one retry.
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_expired_twice_surfaces() {
        let store = Arc::new(MemoryStore::new());
        let loc = store.store_block(b"hello");
        store.expire_next_fetches(2);
        let reader = reader(&store);

        let err = reader.fetch(&loc).await.unwrap_err();
        assert!(matches!(err, KeepError::Expired(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fresh_locator() {
        let store = Arc::new(MemoryStore::new());
        let loc = store.store_block(b"hello");
        let reader = reader(&store);

        // Still valid locally: handed back as is.
        assert_eq!(reader.fresh_locator(&loc, false).await.unwrap(), loc);
        assert_eq!(reader.resigned_len(), 0);

        store.advance_clock(Duration::from_secs(30 * 24 * 3600));
        let fresh = reader.fresh_locator(&loc, true).await.unwrap();
        assert_eq!(fresh.unsigned(), loc.unsigned());
        assert_ne!(fresh, loc);
        assert_eq!(reader.resigned_len(), 1);
        // Later lookups reuse the remembered signature.
        assert_eq!(reader.fresh_locator(&loc, false).await.unwrap(), fresh);
    }

    #[tokio::test]
    async fn test_resigned_map_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let reader = reader(&store);
        for i in 0..(MAX_RESIGNED + 10) {
            let loc = store.store_block(format!("block {i}").as_bytes());
            reader.fresh_locator(&loc, true).await.unwrap();
        }
        assert_eq!(reader.resigned_len(), MAX_RESIGNED);
    }

    #[tokio::test]
    async fn test_not_found() {
        let store = Arc::new(MemoryStore::new());
        let reader = reader(&store);
        let loc = store.sign(&Locator::for_data(b"never stored"));
        assert!(matches!(
            reader.fetch(&loc).await,
            Err(KeepError::NotFound(_))
        ));
    }
}
