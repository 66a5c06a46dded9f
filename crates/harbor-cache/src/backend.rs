//! Storage backends behind [`CacheStorage`](crate::CacheStorage).

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::{CacheError, CacheKey, CachedResponse};

/// Key and capture time of a stored entry, used for eviction scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: CacheKey,
    pub cached_at: u64,
}

/// Persistent key→response storage partitioned by cache name.
///
/// `put` into a cache that does not exist yet creates it.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create an empty cache if it does not exist.
    async fn create_cache(&self, cache: &str) -> Result<(), CacheError>;

    /// Check whether a cache exists.
    async fn has_cache(&self, cache: &str) -> Result<bool, CacheError>;

    /// Delete a cache and all its entries. Returns whether it existed.
    async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError>;

    /// Names of all caches, in creation order.
    async fn cache_names(&self) -> Result<Vec<String>, CacheError>;

    /// Look up one entry.
    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError>;

    /// Insert or replace one entry.
    async fn put(
        &self,
        cache: &str,
        key: &CacheKey,
        response: &CachedResponse,
    ) -> Result<(), CacheError>;

    /// Remove one entry. Returns whether it existed.
    async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError>;

    /// Key and timestamp of every entry in a cache.
    async fn entries(&self, cache: &str) -> Result<Vec<EntryMeta>, CacheError>;
}

type Partition = Arc<RwLock<HashMap<CacheKey, CachedResponse>>>;

/// Volatile backend. Each cache has its own lock.
#[derive(Default)]
pub struct MemoryBackend {
    caches: RwLock<Vec<(String, Partition)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn partition(&self, cache: &str) -> Option<Partition> {
        self.caches
            .read()
            .await
            .iter()
            .find(|(name, _)| name == cache)
            .map(|(_, p)| Arc::clone(p))
    }

    async fn partition_or_create(&self, cache: &str) -> Partition {
        if let Some(p) = self.partition(cache).await {
            return p;
        }
        let mut caches = self.caches.write().await;
        if let Some((_, p)) = caches.iter().find(|(name, _)| name == cache) {
            return Arc::clone(p);
        }
        let p: Partition = Arc::new(RwLock::new(HashMap::new()));
        caches.push((cache.to_string(), Arc::clone(&p)));
        p
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn create_cache(&self, cache: &str) -> Result<(), CacheError> {
        self.partition_or_create(cache).await;
        Ok(())
    }

    async fn has_cache(&self, cache: &str) -> Result<bool, CacheError> {
        Ok(self.partition(cache).await.is_some())
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|(name, _)| name != cache);
        Ok(caches.len() != before)
    }

    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        match self.partition(cache).await {
            Some(p) => Ok(p.read().await.get(key).cloned()),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        cache: &str,
        key: &CacheKey,
        response: &CachedResponse,
    ) -> Result<(), CacheError> {
        let p = self.partition_or_create(cache).await;
        p.write().await.insert(key.clone(), response.clone());
        Ok(())
    }

    async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError> {
        match self.partition(cache).await {
            Some(p) => Ok(p.write().await.remove(key).is_some()),
            None => Ok(false),
        }
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryMeta>, CacheError> {
        match self.partition(cache).await {
            Some(p) => Ok(p
                .read()
                .await
                .iter()
                .map(|(key, entry)| EntryMeta {
                    key: key.clone(),
                    cached_at: entry.cached_at,
                })
                .collect()),
            None => Ok(Vec::new()),
        }
    }
}
