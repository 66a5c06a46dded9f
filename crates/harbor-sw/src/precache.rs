//! Precache manifest loading and the all-or-nothing install.
//!
//! Every manifest entry is fetched into a staging list first. Nothing is
//! written to the version's precache until all fetches succeeded, so a
//! failed install never leaves a partially populated precache behind.

use std::path::Path;

use futures::future::try_join_all;
use harbor_cache::{CacheKey, CacheStorage, CachedResponse};
use harbor_net::{Fetcher, Request, Response};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::version::CacheVersion;
use crate::ServiceWorkerError;

/// Query parameter carrying the revision in precache keys.
pub const REVISION_PARAM: &str = "__harbor_revision";

// ==================== Manifest ====================

/// One build artifact to precache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheEntry {
    pub url: String,

    /// Content revision; `None` for URLs that already embed a content hash.
    #[serde(default)]
    pub revision: Option<String>,
}

impl PrecacheEntry {
    pub fn new(url: impl Into<String>, revision: Option<&str>) -> Self {
        Self {
            url: url.into(),
            revision: revision.map(str::to_string),
        }
    }
}

/// Ordered, validated list of precache entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrecacheManifest {
    entries: Vec<PrecacheEntry>,
}

impl PrecacheManifest {
    /// Validate entries. Exact duplicates are collapsed; the same URL with
    /// two different revisions is rejected.
    pub fn new(entries: Vec<PrecacheEntry>) -> Result<Self, ServiceWorkerError> {
        let mut seen: HashMap<String, Option<String>> = HashMap::new();
        let mut unique = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.url.trim().is_empty() {
                return Err(ServiceWorkerError::Manifest("entry with empty url".into()));
            }
            match seen.get(&entry.url) {
                Some(revision) if *revision == entry.revision => continue,
                Some(revision) => {
                    return Err(ServiceWorkerError::Manifest(format!(
                        "{} listed with conflicting revisions {:?} and {:?}",
                        entry.url, revision, entry.revision
                    )));
                }
                None => {
                    seen.insert(entry.url.clone(), entry.revision.clone());
                    unique.push(entry);
                }
            }
        }

        Ok(Self { entries: unique })
    }

    /// Parse a JSON array of `{"url", "revision"}` objects.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let entries: Vec<PrecacheEntry> = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::Manifest(format!("invalid manifest: {e}")))?;
        Self::new(entries)
    }

    pub fn from_file(path: &Path) -> Result<Self, ServiceWorkerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Manifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn entries(&self) -> &[PrecacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Precache ====================

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecacheReport {
    pub cache_name: String,
    /// Entries downloaded from the network.
    pub fetched: usize,
    /// Entries copied from another version's precache.
    pub reused: usize,
    /// Manifest size.
    pub total: usize,
}

#[derive(Debug, Clone)]
struct Resolved {
    url: Url,
    key: CacheKey,
}

/// A manifest resolved against the origin and bound to one version.
#[derive(Debug)]
pub struct Precache {
    version: CacheVersion,
    entries: Vec<Resolved>,
    /// Plain URL (no fragment) → index into `entries`.
    lookup: HashMap<String, usize>,
    offline_url: Url,
    ignored_params: Vec<String>,
    directory_index: Option<String>,
}

impl Precache {
    pub fn new(config: &WorkerConfig, manifest: &PrecacheManifest) -> Result<Self, ServiceWorkerError> {
        let mut entries = Vec::with_capacity(manifest.len());
        let mut lookup = HashMap::with_capacity(manifest.len());

        for entry in manifest.entries() {
            let mut url = config
                .resolve(&entry.url)
                .map_err(|e| ServiceWorkerError::Manifest(e.to_string()))?;
            url.set_fragment(None);
            let key = CacheKey::get(&revisioned(&url, entry.revision.as_deref()));
            lookup.insert(url.to_string(), entries.len());
            entries.push(Resolved { url, key });
        }

        Ok(Self {
            version: config.cache_version(),
            entries,
            lookup,
            offline_url: config.resolve(&config.offline_url)?,
            ignored_params: config.ignored_query_params.clone(),
            directory_index: config.directory_index.clone(),
        })
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    /// Name of the cache holding this version's entries.
    pub fn cache_name(&self) -> String {
        self.version.precache_name()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offline_url(&self) -> &Url {
        &self.offline_url
    }

    /// Precache key for a request URL, trying the URL as-is, without
    /// ignored query parameters, with the directory index appended and
    /// with `.html` appended.
    pub fn lookup(&self, url: &Url) -> Option<&CacheKey> {
        let mut url = url.clone();
        url.set_fragment(None);

        let mut candidates = vec![url.clone()];

        let stripped = self.strip_ignored_params(&url);
        if stripped != url {
            candidates.push(stripped.clone());
        }

        if stripped.path().ends_with('/') {
            if let Some(ref index) = self.directory_index {
                let mut with_index = stripped.clone();
                with_index.set_path(&format!("{}{index}", stripped.path()));
                candidates.push(with_index);
            }
        } else {
            let mut clean = stripped.clone();
            clean.set_path(&format!("{}.html", stripped.path()));
            candidates.push(clean);
        }

        candidates
            .iter()
            .find_map(|candidate| self.lookup.get(candidate.as_str()))
            .map(|&i| &self.entries[i].key)
    }

    fn strip_ignored_params(&self, url: &Url) -> Url {
        if url.query().is_none() {
            return url.clone();
        }

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !self.is_ignored(name))
            .map(|(n, v)| (n.into_owned(), v.into_owned()))
            .collect();

        let mut stripped = url.clone();
        if kept.is_empty() {
            stripped.set_query(None);
        } else {
            stripped.query_pairs_mut().clear().extend_pairs(kept);
        }
        stripped
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored_params.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        })
    }

    /// Fetch every entry plus the offline document, then commit them to
    /// this version's caches.
    pub async fn install(
        &self,
        fetcher: &dyn Fetcher,
        storage: &CacheStorage,
    ) -> Result<PrecacheReport, ServiceWorkerError> {
        let cache_name = self.cache_name();
        let offline_name = self.version.offline_name();

        let reusable = self.find_reusable(storage, &cache_name).await?;
        let to_fetch: Vec<&Resolved> = self
            .entries
            .iter()
            .filter(|e| !reusable.contains_key(&e.key))
            .collect();

        debug!(
            version = %self.version,
            fetch = to_fetch.len(),
            reuse = reusable.len(),
            "Staging precache"
        );

        let staged = try_join_all(to_fetch.iter().map(|entry| async move {
            let response = fetch_artifact(fetcher, &entry.url).await?;
            Ok::<_, ServiceWorkerError>((entry.key.clone(), response))
        }))
        .await?;
        let offline = fetch_artifact(fetcher, &self.offline_url).await?;

        // Everything is staged; commit.
        let precache_existed = storage.has(&cache_name).await?;
        let offline_existed = storage.has(&offline_name).await?;

        let commit = async {
            let precache = storage.open(&cache_name).await?;
            for (key, response) in &staged {
                precache.put_response(key, response).await?;
            }
            for (key, entry) in &reusable {
                precache.put(key, entry.clone()).await?;
            }
            let offline_cache = storage.open(&offline_name).await?;
            offline_cache
                .put_response(&CacheKey::get(&self.offline_url), &offline)
                .await?;
            Ok::<_, harbor_cache::CacheError>(())
        };

        if let Err(e) = commit.await {
            warn!(version = %self.version, error = %e, "Precache commit failed, rolling back");
            if !precache_existed {
                storage.delete(&cache_name).await.ok();
            }
            if !offline_existed {
                storage.delete(&offline_name).await.ok();
            }
            return Err(e.into());
        }

        let report = PrecacheReport {
            cache_name,
            fetched: staged.len(),
            reused: reusable.len(),
            total: self.entries.len(),
        };
        info!(
            version = %self.version,
            fetched = report.fetched,
            reused = report.reused,
            "Precache installed"
        );
        Ok(report)
    }

    /// Entries already stored under the same key in another version's
    /// precache. The key embeds the revision, so equal keys mean equal
    /// content.
    async fn find_reusable(
        &self,
        storage: &CacheStorage,
        own_name: &str,
    ) -> Result<HashMap<CacheKey, CachedResponse>, ServiceWorkerError> {
        let mut found = HashMap::new();
        let wanted: HashSet<&CacheKey> = self.entries.iter().map(|e| &e.key).collect();

        for name in storage.keys().await? {
            if name == own_name || !CacheVersion::is_precache(&name) {
                continue;
            }
            let cache = storage.open(&name).await?;
            for key in &wanted {
                if found.contains_key(*key) {
                    continue;
                }
                if let Some(entry) = cache.get(key).await? {
                    found.insert((*key).clone(), entry);
                }
            }
        }
        Ok(found)
    }

    /// Serve a precached URL, if present.
    pub async fn match_url(
        &self,
        storage: &CacheStorage,
        url: &Url,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let Some(key) = self.lookup(url) else {
            return Ok(None);
        };
        self.read(storage, &self.cache_name(), key).await
    }

    /// The offline document stored at install.
    pub async fn offline_response(
        &self,
        storage: &CacheStorage,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let key = CacheKey::get(&self.offline_url);
        self.read(storage, &self.version.offline_name(), &key).await
    }

    async fn read(
        &self,
        storage: &CacheStorage,
        cache_name: &str,
        key: &CacheKey,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        if !storage.has(cache_name).await? {
            return Ok(None);
        }
        let cache = storage.open(cache_name).await?;
        match cache.get(key).await? {
            Some(entry) => Ok(Some(entry.to_response()?)),
            None => Ok(None),
        }
    }
}

fn revisioned(url: &Url, revision: Option<&str>) -> Url {
    let mut url = url.clone();
    if let Some(revision) = revision {
        url.query_pairs_mut().append_pair(REVISION_PARAM, revision);
    }
    url
}

async fn fetch_artifact(fetcher: &dyn Fetcher, url: &Url) -> Result<Response, ServiceWorkerError> {
    let response = fetcher
        .fetch(&Request::get(url.clone()))
        .await
        .map_err(|e| ServiceWorkerError::InstallFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if !response.ok() {
        return Err(ServiceWorkerError::InstallFailed {
            url: url.to_string(),
            reason: format!("status {}", response.status),
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_net::mock::MockFetcher;

    const ORIGIN: &str = "https://app.example.com";

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            version: version.to_string(),
            ..WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
        }
    }

    fn manifest() -> PrecacheManifest {
        PrecacheManifest::from_json(
            r#"[
                {"url": "/index.html", "revision": "a1"},
                {"url": "/app.3f9c.js", "revision": null},
                {"url": "/styles.css", "revision": "c3"}
            ]"#,
        )
        .unwrap()
    }

    fn serve_all(fetcher: &MockFetcher) {
        fetcher
            .respond(&format!("{ORIGIN}/index.html"), 200, "<html>shell</html>")
            .respond(&format!("{ORIGIN}/app.3f9c.js"), 200, "js")
            .respond(&format!("{ORIGIN}/styles.css"), 200, "css")
            .respond(&format!("{ORIGIN}/offline.html"), 200, "offline");
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("{ORIGIN}{path}")).unwrap()
    }

    #[test]
    fn test_manifest_rejects_conflicting_revisions() {
        let err = PrecacheManifest::from_json(
            r#"[{"url": "/a.js", "revision": "1"}, {"url": "/a.js", "revision": "2"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Manifest(_)));
    }

    #[test]
    fn test_manifest_collapses_exact_duplicates() {
        let manifest = PrecacheManifest::from_json(
            r#"[{"url": "/a.js", "revision": "1"}, {"url": "/a.js", "revision": "1"}]"#,
        )
        .unwrap();
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_manifest_rejects_garbage() {
        assert!(PrecacheManifest::from_json("{\"url\": 1}").is_err());
        assert!(PrecacheManifest::new(vec![PrecacheEntry::new(" ", None)]).is_err());
    }

    #[test]
    fn test_revisioned_keys() {
        let precache = Precache::new(&config("1"), &manifest()).unwrap();
        let key = precache.lookup(&url("/index.html")).unwrap();
        assert_eq!(key.url, format!("{ORIGIN}/index.html?__harbor_revision=a1"));

        let hashed = precache.lookup(&url("/app.3f9c.js")).unwrap();
        assert_eq!(hashed.url, format!("{ORIGIN}/app.3f9c.js"));
    }

    #[test]
    fn test_lookup_variations() {
        let precache = Precache::new(&config("1"), &manifest()).unwrap();
        let index = precache.lookup(&url("/index.html")).cloned();

        assert_eq!(precache.lookup(&url("/")).cloned(), index);
        assert_eq!(precache.lookup(&url("/index")).cloned(), index);
        assert_eq!(
            precache.lookup(&url("/index.html?utm_source=mail&fbclid=x")).cloned(),
            index
        );
        assert_eq!(precache.lookup(&url("/index.html#top")).cloned(), index);
        assert!(precache.lookup(&url("/index.html?page=2")).is_none());
        assert!(precache.lookup(&url("/missing.js")).is_none());
    }

    #[tokio::test]
    async fn test_install_commits_everything() {
        let fetcher = MockFetcher::new();
        serve_all(&fetcher);
        let storage = CacheStorage::in_memory();
        let precache = Precache::new(&config("1"), &manifest()).unwrap();

        let report = precache.install(&fetcher, &storage).await.unwrap();
        assert_eq!(report.cache_name, "harbor-precache-1");
        assert_eq!((report.fetched, report.reused, report.total), (3, 0, 3));

        let shell = precache.match_url(&storage, &url("/")).await.unwrap().unwrap();
        assert_eq!(shell.body.as_ref(), b"<html>shell</html>");
        let offline = precache.offline_response(&storage).await.unwrap().unwrap();
        assert_eq!(offline.body.as_ref(), b"offline");
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let fetcher = MockFetcher::new();
        serve_all(&fetcher);
        fetcher.respond(&format!("{ORIGIN}/styles.css"), 404, "");
        let storage = CacheStorage::in_memory();
        let precache = Precache::new(&config("1"), &manifest()).unwrap();

        let err = precache.install(&fetcher, &storage).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { ref url, .. } if url.ends_with("/styles.css")));
        assert!(!storage.has("harbor-precache-1").await.unwrap());
        assert!(!storage.has("harbor-offline-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_offline_document_fails_install() {
        let fetcher = MockFetcher::new();
        serve_all(&fetcher);
        fetcher.fail(&format!("{ORIGIN}/offline.html"));
        let storage = CacheStorage::in_memory();
        let precache = Precache::new(&config("1"), &manifest()).unwrap();

        assert!(precache.install(&fetcher, &storage).await.is_err());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_revisions_are_reused() {
        let fetcher = MockFetcher::new();
        serve_all(&fetcher);
        let storage = CacheStorage::in_memory();
        Precache::new(&config("1"), &manifest())
            .unwrap()
            .install(&fetcher, &storage)
            .await
            .unwrap();

        let next = PrecacheManifest::from_json(
            r#"[
                {"url": "/index.html", "revision": "a2"},
                {"url": "/app.3f9c.js", "revision": null},
                {"url": "/styles.css", "revision": "c3"}
            ]"#,
        )
        .unwrap();
        let v2 = Precache::new(&config("2"), &next).unwrap();
        let report = v2.install(&fetcher, &storage).await.unwrap();

        assert_eq!((report.fetched, report.reused), (1, 2));
        assert_eq!(fetcher.calls(&format!("{ORIGIN}/styles.css")), 1);
        assert_eq!(fetcher.calls(&format!("{ORIGIN}/index.html")), 2);
        assert!(v2.match_url(&storage, &url("/styles.css")).await.unwrap().is_some());
    }
}
