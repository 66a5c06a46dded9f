//! Worker configuration

use std::path::Path;
use std::time::Duration;

use harbor_cache::ExpirationPolicy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::version::CacheVersion;
use crate::ServiceWorkerError;

const DAY: u64 = 24 * 60 * 60;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker is registered for
    pub origin: Url,

    /// Version key for the precache and offline caches
    pub version: String,

    /// Document served when a navigation fails offline
    pub offline_url: String,

    /// Precached document every navigation is bound to, if any
    pub app_shell_url: Option<String>,

    /// Path prefixes whose navigations are never routed to the app shell
    pub navigation_denylist: Vec<String>,

    /// File appended to directory URLs when matching the precache
    pub directory_index: Option<String>,

    /// Query parameters ignored when matching the precache; a trailing `*`
    /// makes the entry a prefix
    pub ignored_query_params: Vec<String>,

    /// Same-origin extensions routed to the image cache
    pub image_extensions: Vec<String>,

    /// Same-origin extensions routed to the static resource cache
    pub static_extensions: Vec<String>,

    /// Host serving webfont stylesheets
    pub font_stylesheet_host: String,

    /// Host serving webfont files
    pub font_file_host: String,

    pub images: RuntimeCacheConfig,
    pub static_resources: RuntimeCacheConfig,
    pub font_stylesheets: RuntimeCacheConfig,
    pub font_files: RuntimeCacheConfig,

    /// How often the foreground polls for a waiting worker, in seconds
    pub update_check_interval_secs: u64,
}

/// Cache name and limits for one runtime route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCacheConfig {
    pub cache_name: String,

    #[serde(default)]
    pub expiration: ExpirationPolicy,

    /// Response statuses worth storing
    #[serde(default = "default_cacheable_statuses")]
    pub cacheable_statuses: Vec<u16>,
}

fn default_cacheable_statuses() -> Vec<u16> {
    vec![200]
}

impl RuntimeCacheConfig {
    fn named(cache_name: &str) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            expiration: ExpirationPolicy::unbounded(),
            cacheable_statuses: default_cacheable_statuses(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8080/").expect("static origin parses"),
            version: "1".to_string(),
            offline_url: "/offline.html".to_string(),
            app_shell_url: None,
            navigation_denylist: vec!["/api/".to_string()],
            directory_index: Some("index.html".to_string()),
            ignored_query_params: vec!["utm_*".to_string(), "fbclid".to_string()],
            image_extensions: ["png", "jpg", "jpeg", "svg", "gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            static_extensions: vec!["css".to_string(), "js".to_string()],
            font_stylesheet_host: "fonts.googleapis.com".to_string(),
            font_file_host: "fonts.gstatic.com".to_string(),
            images: RuntimeCacheConfig {
                expiration: ExpirationPolicy::default()
                    .with_max_entries(50)
                    .with_max_age(Duration::from_secs(30 * DAY)),
                ..RuntimeCacheConfig::named("images")
            },
            static_resources: RuntimeCacheConfig::named("static-resources"),
            font_stylesheets: RuntimeCacheConfig::named("google-fonts-stylesheets"),
            font_files: RuntimeCacheConfig {
                expiration: ExpirationPolicy::default()
                    .with_max_entries(30)
                    .with_max_age(Duration::from_secs(365 * DAY)),
                // Font files come back opaque from no-cors requests.
                cacheable_statuses: vec![0, 200],
                ..RuntimeCacheConfig::named("google-fonts-webfonts")
            },
            update_check_interval_secs: 60 * 60,
        }
    }
}

impl WorkerConfig {
    /// Default configuration for `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid worker config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ServiceWorkerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::Config(format!(
                "origin must be http(s), got {}",
                self.origin
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::Config("version must not be empty".into()));
        }
        let offline = self.resolve(&self.offline_url)?;
        if offline.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::Config(format!(
                "offline document {offline} is not on origin {}",
                self.origin
            )));
        }
        if let Some(ref shell) = self.app_shell_url {
            self.resolve(shell)?;
        }

        let names = [
            &self.images.cache_name,
            &self.static_resources.cache_name,
            &self.font_stylesheets.cache_name,
            &self.font_files.cache_name,
        ];
        for name in names {
            if CacheVersion::is_versioned(name) {
                return Err(ServiceWorkerError::Config(format!(
                    "runtime cache name '{name}' collides with versioned cache names"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a path or URL against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::Config(format!("cannot resolve '{path}': {e}")))
    }

    pub fn cache_version(&self) -> CacheVersion {
        CacheVersion::new(self.version.clone())
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_route_table() {
        let config = WorkerConfig::default();
        assert_eq!(config.images.cache_name, "images");
        assert_eq!(config.images.expiration.max_entries, Some(50));
        assert_eq!(
            config.images.expiration.max_age,
            Some(Duration::from_secs(30 * DAY))
        );
        assert_eq!(config.static_resources.expiration, ExpirationPolicy::unbounded());
        assert_eq!(config.font_files.expiration.max_entries, Some(30));
        assert_eq!(config.font_files.cacheable_statuses, vec![0, 200]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = WorkerConfig::from_json(
            r#"{ "origin": "https://app.example.com/", "version": "42", "app_shell_url": "/index.html" }"#,
        )
        .unwrap();

        assert_eq!(config.origin.as_str(), "https://app.example.com/");
        assert_eq!(config.cache_version().precache_name(), "harbor-precache-42");
        assert_eq!(config.app_shell_url.as_deref(), Some("/index.html"));
        assert_eq!(config.offline_url, "/offline.html");
        assert_eq!(config.font_file_host, "fonts.gstatic.com");
    }

    #[test]
    fn test_runtime_cache_json() {
        let config = WorkerConfig::from_json(
            r#"{ "images": { "cache_name": "pics", "expiration": { "max_entries": 5, "max_age": 60 } } }"#,
        )
        .unwrap();
        assert_eq!(config.images.cache_name, "pics");
        assert_eq!(config.images.expiration.max_age, Some(Duration::from_secs(60)));
        assert_eq!(config.images.cacheable_statuses, vec![200]);
    }

    #[test]
    fn test_rejects_cross_origin_offline_page() {
        let err = WorkerConfig::from_json(
            r#"{ "origin": "https://example.com/", "offline_url": "https://cdn.example.net/offline.html" }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Config(_)));
    }

    #[test]
    fn test_rejects_versioned_runtime_cache_name() {
        let mut config = WorkerConfig::default();
        config.images.cache_name = "harbor-precache-images".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_version() {
        assert!(WorkerConfig::from_json(r#"{ "version": " " }"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{ "version": "7" }"#).unwrap();
        assert_eq!(WorkerConfig::from_file(&path).unwrap().version, "7");
        assert!(WorkerConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
