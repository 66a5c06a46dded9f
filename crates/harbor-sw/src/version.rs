//! Pairing of version-scoped cache names with a worker version.

use serde::{Deserialize, Serialize};

const PRECACHE_PREFIX: &str = "harbor-precache-";
const OFFLINE_PREFIX: &str = "harbor-offline-";

/// The version key embedded in every version-scoped cache name.
///
/// Strategy caches (`images`, `static-resources`, ...) are not versioned and
/// survive activations; the precache and offline caches are, so activation
/// can delete other versions' caches by name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of this version's precache.
    pub fn precache_name(&self) -> String {
        format!("{PRECACHE_PREFIX}{}", self.0)
    }

    /// Name of this version's offline-fallback cache.
    pub fn offline_name(&self) -> String {
        format!("{OFFLINE_PREFIX}{}", self.0)
    }

    /// Whether `name` is a version-scoped cache of any version.
    pub fn is_versioned(name: &str) -> bool {
        name.starts_with(PRECACHE_PREFIX) || name.starts_with(OFFLINE_PREFIX)
    }

    /// Whether `name` is a precache of any version.
    pub fn is_precache(name: &str) -> bool {
        name.starts_with(PRECACHE_PREFIX)
    }

    /// Whether `name` belongs to this version.
    pub fn owns(&self, name: &str) -> bool {
        name == self.precache_name() || name == self.offline_name()
    }

    /// Whether `name` is a versioned cache of another version.
    pub fn is_stale(&self, name: &str) -> bool {
        Self::is_versioned(name) && !self.owns(name)
    }
}

impl std::fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
