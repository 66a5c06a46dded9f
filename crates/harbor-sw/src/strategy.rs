//! Caching strategies.
//!
//! Cache read and write failures never fail a request: they are logged and
//! the strategy continues as if the cache missed.

use std::sync::Arc;

use harbor_cache::{Cache, CacheKey, CacheStorage};
use harbor_net::{Fetcher, NetError, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::precache::Precache;
use crate::router::CachePolicy;
use crate::ServiceWorkerError;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Cache,
    Network,
    Precache,
    OfflineFallback,
}

/// A response plus how it was produced.
#[derive(Debug)]
pub struct StrategyResponse {
    pub response: Response,
    pub source: ResponseSource,
    /// Background refresh started by StaleWhileRevalidate, if any.
    pub revalidation: Option<JoinHandle<()>>,
}

impl StrategyResponse {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self {
            response,
            source,
            revalidation: None,
        }
    }
}

/// Executes strategies against the shared cache storage and the network.
#[derive(Clone)]
pub struct StrategyEngine {
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl StrategyEngine {
    pub fn new(storage: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { storage, fetcher }
    }

    /// Serve the unexpired cached entry, else fetch and store.
    pub async fn cache_first(
        &self,
        request: &Request,
        policy: &CachePolicy,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        let key = CacheKey::from_request(request);
        let cache = self.open(policy).await;

        if let Some(ref cache) = cache {
            if let Some(response) = lookup(cache, &key).await {
                return Ok(StrategyResponse::new(response, ResponseSource::Cache));
            }
        }

        let response = self.fetcher.fetch(request).await?;
        if let Some(ref cache) = cache {
            store(cache, policy, &key, &response).await;
        }
        Ok(StrategyResponse::new(response, ResponseSource::Network))
    }

    /// Serve the cached entry immediately and refresh it in the background.
    /// On a miss the network response is awaited and stored.
    pub async fn stale_while_revalidate(
        &self,
        request: &Request,
        policy: &CachePolicy,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        let key = CacheKey::from_request(request);
        let Some(cache) = self.open(policy).await else {
            return self.network_only(request).await;
        };

        if let Some(response) = lookup(&cache, &key).await {
            let fetcher = Arc::clone(&self.fetcher);
            let policy = policy.clone();
            let request = request.clone();
            let handle = tokio::spawn(async move {
                match fetcher.fetch(&request).await {
                    Ok(fresh) => store(&cache, &policy, &key, &fresh).await,
                    Err(e) => debug!(url = %request.url, error = %e, "Revalidation failed"),
                }
            });
            return Ok(StrategyResponse {
                response,
                source: ResponseSource::Cache,
                revalidation: Some(handle),
            });
        }

        let response = self.fetcher.fetch(request).await?;
        store(&cache, policy, &key, &response).await;
        Ok(StrategyResponse::new(response, ResponseSource::Network))
    }

    /// Straight to the network.
    pub async fn network_only(&self, request: &Request) -> Result<StrategyResponse, ServiceWorkerError> {
        let response = self.fetcher.fetch(request).await?;
        Ok(StrategyResponse::new(response, ResponseSource::Network))
    }

    /// Serve a precached entry; fall back to the network if it is missing.
    /// A navigation that also fails on the network gets the offline page.
    pub async fn precached(
        &self,
        request: &Request,
        precache: &Precache,
        key: &CacheKey,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        let cache_name = precache.cache_name();
        match self.storage.open(&cache_name).await {
            Ok(cache) => {
                if let Some(response) = lookup(&cache, key).await {
                    return Ok(StrategyResponse::new(response, ResponseSource::Precache));
                }
                debug!(cache = %cache_name, key = %key, "Precache entry missing, using network");
            }
            Err(e) => warn!(cache = %cache_name, error = %e, "Cannot open precache"),
        }

        if !request.is_navigation() {
            return self.network_only(request).await;
        }
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(StrategyResponse::new(response, ResponseSource::Network)),
            Err(error) => self.offline_fallback(request, precache, error).await,
        }
    }

    /// Document navigation: the precached app shell if configured, else the
    /// network with the precached offline document as fallback.
    pub async fn navigate(
        &self,
        request: &Request,
        precache: &Precache,
        app_shell: Option<&Url>,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        if let Some(shell) = app_shell {
            match precache.match_url(&self.storage, shell).await {
                Ok(Some(response)) => {
                    return Ok(StrategyResponse::new(response, ResponseSource::Precache));
                }
                Ok(None) => debug!(shell = %shell, "App shell not precached"),
                Err(e) => warn!(shell = %shell, error = %e, "Cannot read app shell"),
            }
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(StrategyResponse::new(response, ResponseSource::Network)),
            Err(error) => self.offline_fallback(request, precache, error).await,
        }
    }

    /// The precached offline page in place of a failed navigation. The
    /// network error only surfaces when the offline page is missing too.
    async fn offline_fallback(
        &self,
        request: &Request,
        precache: &Precache,
        error: NetError,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        match precache.offline_response(&self.storage).await {
            Ok(Some(offline)) => {
                warn!(url = %request.url, error = %error, "Navigation failed, serving offline page");
                Ok(StrategyResponse::new(offline, ResponseSource::OfflineFallback))
            }
            Ok(None) => Err(error.into()),
            Err(e) => {
                warn!(error = %e, "Cannot read offline page");
                Err(error.into())
            }
        }
    }

    async fn open(&self, policy: &CachePolicy) -> Option<Arc<Cache>> {
        match self
            .storage
            .open_with_policy(&policy.cache_name, policy.expiration)
            .await
        {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(cache = %policy.cache_name, error = %e, "Cannot open cache");
                None
            }
        }
    }
}

async fn lookup(cache: &Cache, key: &CacheKey) -> Option<Response> {
    let entry = match cache.get(key).await {
        Ok(entry) => entry?,
        Err(e) => {
            warn!(cache = cache.name(), key = %key, error = %e, "Cache read failed");
            return None;
        }
    };
    match entry.to_response() {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(cache = cache.name(), key = %key, error = %e, "Dropping unreadable entry");
            None
        }
    }
}

async fn store(cache: &Cache, policy: &CachePolicy, key: &CacheKey, response: &Response) {
    if !policy.is_cacheable(response.status) {
        trace!(cache = cache.name(), status = response.status, "Not caching response");
        return;
    }
    if let Err(e) = cache.put_response(key, response).await {
        warn!(cache = cache.name(), key = %key, error = %e, "Cache write failed");
    }
}
