//! Request classification.
//!
//! Routes are evaluated in a fixed order and the first match wins:
//!
//! 1. same-origin precached URL → precache
//! 2. same-origin navigation → app shell (unless denylisted), network, then
//!    the offline page
//! 3. same-origin image → `images`, CacheFirst
//! 4. same-origin script or stylesheet → `static-resources`, StaleWhileRevalidate
//! 5. webfont stylesheet host → `google-fonts-stylesheets`, StaleWhileRevalidate
//! 6. webfont file host → `google-fonts-webfonts`, CacheFirst
//! 7. anything else → network only
//!
//! Only GET requests reach a caching route.

use std::sync::Arc;

use harbor_cache::{CacheKey, ExpirationPolicy};
use harbor_net::Request;
use serde::Serialize;
use tracing::debug;
use url::{Origin, Url};

use crate::config::{RuntimeCacheConfig, WorkerConfig};
use crate::precache::Precache;

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    CacheFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    PrecachedMatch,
}

/// How one class of requests is cached.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub strategy: Strategy,
    pub cache_name: String,
    pub expiration: ExpirationPolicy,
    pub cacheable_statuses: Vec<u16>,
}

impl CachePolicy {
    fn runtime(strategy: Strategy, cache: &RuntimeCacheConfig) -> Self {
        Self {
            strategy,
            cache_name: cache.cache_name.clone(),
            expiration: cache.expiration,
            cacheable_statuses: cache.cacheable_statuses.clone(),
        }
    }

    /// Whether a response with `status` may be stored.
    pub fn is_cacheable(&self, status: u16) -> bool {
        self.cacheable_statuses.contains(&status)
    }
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Serve from the version's precache under `key`.
    Precached { cache_name: String, key: CacheKey },
    /// Document navigation. `app_shell` is false for denylisted paths, which
    /// still get the offline page when the network fails.
    Navigation { app_shell: bool },
    /// Runtime-cached route.
    Cached(CachePolicy),
    /// Straight to the network, nothing stored.
    NetworkOnly,
}

impl RouteDecision {
    pub fn strategy(&self) -> Option<Strategy> {
        match self {
            RouteDecision::Precached { .. } => Some(Strategy::PrecachedMatch),
            RouteDecision::Navigation { .. } => None,
            RouteDecision::Cached(policy) => Some(policy.strategy),
            RouteDecision::NetworkOnly => Some(Strategy::NetworkOnly),
        }
    }
}

/// Request router for one worker version.
#[derive(Debug)]
pub struct Router {
    config: Arc<WorkerConfig>,
    precache: Arc<Precache>,
    origin: Origin,
    images: CachePolicy,
    static_resources: CachePolicy,
    font_stylesheets: CachePolicy,
    font_files: CachePolicy,
}

impl Router {
    pub fn new(config: Arc<WorkerConfig>, precache: Arc<Precache>) -> Self {
        Self {
            origin: config.origin.origin(),
            images: CachePolicy::runtime(Strategy::CacheFirst, &config.images),
            static_resources: CachePolicy::runtime(
                Strategy::StaleWhileRevalidate,
                &config.static_resources,
            ),
            font_stylesheets: CachePolicy::runtime(
                Strategy::StaleWhileRevalidate,
                &config.font_stylesheets,
            ),
            font_files: CachePolicy::runtime(Strategy::CacheFirst, &config.font_files),
            config,
            precache,
        }
    }

    pub fn classify(&self, request: &Request) -> RouteDecision {
        let decision = self.decide(request);
        debug!(url = %request.url, route = ?decision.strategy(), "Classified request");
        decision
    }

    fn decide(&self, request: &Request) -> RouteDecision {
        if !request.is_cacheable_method() {
            return RouteDecision::NetworkOnly;
        }

        let url = &request.url;
        if request.is_same_origin(&self.origin) {
            if let Some(key) = self.precache.lookup(url) {
                return RouteDecision::Precached {
                    cache_name: self.precache.cache_name(),
                    key: key.clone(),
                };
            }

            if request.is_navigation() {
                return RouteDecision::Navigation {
                    app_shell: !self.is_denylisted(url),
                };
            }

            if let Some(ext) = extension(url) {
                if matches_any(&self.config.image_extensions, &ext) {
                    return RouteDecision::Cached(self.images.clone());
                }
                if matches_any(&self.config.static_extensions, &ext) {
                    return RouteDecision::Cached(self.static_resources.clone());
                }
            }
            return RouteDecision::NetworkOnly;
        }

        match url.host_str() {
            Some(host) if host.eq_ignore_ascii_case(&self.config.font_stylesheet_host) => {
                RouteDecision::Cached(self.font_stylesheets.clone())
            }
            Some(host) if host.eq_ignore_ascii_case(&self.config.font_file_host) => {
                RouteDecision::Cached(self.font_files.clone())
            }
            _ => RouteDecision::NetworkOnly,
        }
    }

    fn is_denylisted(&self, url: &Url) -> bool {
        self.config
            .navigation_denylist
            .iter()
            .any(|prefix| url.path().starts_with(prefix.as_str()))
    }
}

/// Lowercased extension of the last path segment.
fn extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.last()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn matches_any(list: &[String], ext: &str) -> bool {
    list.iter().any(|candidate| candidate.eq_ignore_ascii_case(ext))
}
