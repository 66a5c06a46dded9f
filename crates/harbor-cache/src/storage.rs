//! Named caches with per-cache expiration.

use std::sync::Arc;

use hashbrown::HashMap;
use harbor_net::Response;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::backend::{CacheBackend, MemoryBackend};
use crate::clock::{Clock, SystemClock};
use crate::policy::ExpirationPolicy;
use crate::{CacheError, CacheKey, CachedResponse};

// ==================== Cache ====================

/// Handle to one named cache.
pub struct Cache {
    name: String,
    policy: ExpirationPolicy,
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    /// Serializes writes to this cache only. Shared by every handle opened
    /// for the same name.
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Cache {
    fn new(
        name: &str,
        policy: ExpirationPolicy,
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            policy,
            backend,
            clock,
            write_lock,
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expiration policy applied by this handle.
    pub fn policy(&self) -> ExpirationPolicy {
        self.policy
    }

    /// Current time according to the storage clock.
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Look up an unexpired entry. Expired entries are removed and reported
    /// as absent.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let Some(entry) = self.backend.get(&self.name, key).await? else {
            trace!(cache = %self.name, key = %key, "Cache miss");
            return Ok(None);
        };

        if self.policy.is_expired(entry.cached_at, self.now()) {
            return self.take_expired(key).await;
        }

        trace!(cache = %self.name, key = %key, "Cache hit");
        Ok(Some(entry))
    }

    /// Re-read `key` under the write lock: a put may have replaced the
    /// expired entry since it was read. Only a still-expired entry is deleted.
    async fn take_expired(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let _guard = self.write_lock.lock().await;
        match self.backend.get(&self.name, key).await? {
            Some(current) if !self.policy.is_expired(current.cached_at, self.now()) => {
                trace!(cache = %self.name, key = %key, "Expired entry was replaced");
                Ok(Some(current))
            }
            Some(_) => {
                debug!(cache = %self.name, key = %key, "Dropping expired entry");
                self.backend.delete(&self.name, key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store an entry, then evict whatever the policy no longer allows.
    pub async fn put(&self, key: &CacheKey, entry: CachedResponse) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        self.backend.put(&self.name, key, &entry).await?;
        trace!(cache = %self.name, key = %key, "Stored entry");

        if self.policy.is_bounded() {
            self.evict_locked(Some(key)).await?;
        }
        Ok(())
    }

    /// Store a network response stamped with the current time.
    pub async fn put_response(&self, key: &CacheKey, response: &Response) -> Result<(), CacheError> {
        let entry = CachedResponse::from_response(response, self.now());
        self.put(key, entry).await
    }

    /// Remove one entry.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.backend.delete(&self.name, key).await
    }

    /// All stored keys, oldest first.
    pub async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let mut entries = self.backend.entries(&self.name).await?;
        entries.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then_with(|| a.key.cmp(&b.key)));
        Ok(entries.into_iter().map(|e| e.key).collect())
    }

    /// Number of stored entries, expired ones included until evicted.
    pub async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.backend.entries(&self.name).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len().await? == 0)
    }

    /// Run an eviction scan now. Returns the number of removed entries.
    pub async fn evict(&self) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock().await;
        self.evict_locked(None).await
    }

    async fn evict_locked(&self, keep: Option<&CacheKey>) -> Result<usize, CacheError> {
        let entries = self.backend.entries(&self.name).await?;
        let now = self.now();
        let victims = self.policy.select_evictions(&entries, now, keep);

        for victim in &victims {
            self.backend.delete(&self.name, &victim.key).await?;
        }

        if !victims.is_empty() {
            debug!(cache = %self.name, evicted = victims.len(), "Evicted entries");
        }
        Ok(victims.len())
    }
}

// ==================== Cache Storage ====================

/// All caches of one origin.
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    handles: RwLock<HashMap<String, Arc<Cache>>>,
}

impl CacheStorage {
    /// Create storage over a backend.
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Volatile storage on the wall clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock))
    }

    /// Open a cache (creates if doesn't exist). An already open handle keeps
    /// its policy.
    pub async fn open(&self, name: &str) -> Result<Arc<Cache>, CacheError> {
        if let Some(cache) = self.handles.read().await.get(name) {
            return Ok(Arc::clone(cache));
        }
        self.open_with_policy(name, ExpirationPolicy::unbounded()).await
    }

    /// Open a cache with an explicit policy, replacing the policy of an
    /// already open handle. Stored entries are kept either way.
    pub async fn open_with_policy(
        &self,
        name: &str,
        policy: ExpirationPolicy,
    ) -> Result<Arc<Cache>, CacheError> {
        let mut handles = self.handles.write().await;
        let write_lock = match handles.get(name) {
            Some(cache) if cache.policy == policy => return Ok(Arc::clone(cache)),
            Some(cache) => Arc::clone(&cache.write_lock),
            None => Arc::new(Mutex::new(())),
        };

        self.backend.create_cache(name).await?;
        let cache = Arc::new(Cache::new(
            name,
            policy,
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            write_lock,
        ));
        handles.insert(name.to_string(), Arc::clone(&cache));
        debug!(cache = name, ?policy, "Opened cache");
        Ok(cache)
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.backend.has_cache(name).await
    }

    /// Delete a cache with all its entries.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.handles.write().await.remove(name);
        let existed = self.backend.delete_cache(name).await?;
        if existed {
            debug!(cache = name, "Deleted cache");
        }
        Ok(existed)
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.backend.cache_names().await
    }

    /// Match across all caches, in creation order.
    pub async fn match_request(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        for name in self.keys().await? {
            let cache = self.open(&name).await?;
            if let Some(entry) = cache.get(key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::in_memory()
    }
}
