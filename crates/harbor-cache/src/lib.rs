//! # Harbor Cache
//!
//! Persistent, named request→response caches for the Harbor worker.
//!
//! ## Features
//!
//! - **CacheStorage**: open / has / delete / keys over named caches
//! - **Cache**: get / put / delete with per-cache expiration
//! - **Expiration**: `max_entries` and `max_age` ceilings, evicted on write
//!   and filtered on read
//! - **Backends**: in-memory and SQLite
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage
//!     ├── Cache ("images", ExpirationPolicy)
//!     │       └── CacheKey (method + url) → CachedResponse
//!     ├── Cache ("static-resources")
//!     └── ...
//!             │
//!             ▼
//!     CacheBackend (MemoryBackend | SqliteBackend)
//! ```

use bytes::Bytes;
use harbor_common::HarborError;
use harbor_net::{Request, Response};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod backend;
pub mod clock;
pub mod policy;
pub mod sqlite;
pub mod storage;

pub use backend::{CacheBackend, EntryMeta, MemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use policy::ExpirationPolicy;
pub use sqlite::SqliteBackend;
pub use storage::{Cache, CacheStorage};

// ==================== Errors ====================

/// Errors raised by cache storage.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),
}

impl From<CacheError> for HarborError {
    fn from(err: CacheError) -> Self {
        HarborError::cache_with_source("cache operation failed", err)
    }
}

// ==================== Keys & Entries ====================

/// Normalized request identity: uppercase method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Build a key from a method and URL.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }

    /// Key for an intercepted request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response plus its capture timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Final URL of the response.
    pub url: String,

    /// Response status (0 for opaque responses).
    pub status: u16,

    /// Response headers.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Snapshot a network response.
    pub fn from_response(response: &Response, cached_at: u64) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: response.url.to_string(),
            status: response.status,
            headers,
            body: response.body.clone(),
            cached_at,
        }
    }

    /// Rebuild a response from the stored snapshot.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::InvalidEntry(format!("{}: {}", self.url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response {
            url,
            status: self.status,
            headers,
            body: self.body.clone(),
        })
    }
}
