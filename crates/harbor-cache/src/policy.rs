//! Expiration ceilings for a named cache.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::EntryMeta;

/// Expiration ceilings for one cache.
///
/// An entry is evicted when it violates either bound. With both unset the
/// cache grows without limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    /// Maximum number of entries kept; the oldest captures go first.
    pub max_entries: Option<usize>,

    /// Maximum age of an entry, measured from its capture timestamp.
    #[serde(with = "opt_secs", default)]
    pub max_age: Option<Duration>,
}

impl ExpirationPolicy {
    /// No expiration at all.
    pub const fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_age: None,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Whether any ceiling is configured.
    pub fn is_bounded(&self) -> bool {
        self.max_entries.is_some() || self.max_age.is_some()
    }

    /// Whether an entry captured at `cached_at` is too old at `now`.
    pub fn is_expired(&self, cached_at: u64, now: u64) -> bool {
        match self.max_age {
            Some(max_age) => now.saturating_sub(cached_at) > max_age.as_millis() as u64,
            None => false,
        }
    }

    /// Pick the entries to evict from `entries`.
    ///
    /// `keep` (the entry just written) is never chosen. Expired entries are
    /// chosen first, then the oldest captures until the count fits.
    pub fn select_evictions<'a>(
        &self,
        entries: &'a [EntryMeta],
        now: u64,
        keep: Option<&crate::CacheKey>,
    ) -> Vec<&'a EntryMeta> {
        let mut evict = Vec::new();
        let mut live: Vec<&EntryMeta> = Vec::with_capacity(entries.len());

        for entry in entries {
            if Some(&entry.key) != keep && self.is_expired(entry.cached_at, now) {
                evict.push(entry);
            } else {
                live.push(entry);
            }
        }

        if let Some(max) = self.max_entries {
            if live.len() > max {
                live.sort_by(|a, b| {
                    a.cached_at
                        .cmp(&b.cached_at)
                        .then_with(|| a.key.cmp(&b.key))
                });
                let mut excess = live.len() - max;
                for entry in live {
                    if excess == 0 {
                        break;
                    }
                    if Some(&entry.key) == keep {
                        continue;
                    }
                    evict.push(entry);
                    excess -= 1;
                }
            }
        }

        evict
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
