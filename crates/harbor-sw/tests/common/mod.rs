//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use harbor_cache::{CacheStorage, ManualClock, MemoryBackend};
use harbor_net::mock::MockFetcher;
use harbor_sw::{PrecacheManifest, Registration, WorkerConfig, WorkerContext, WorkerScript};
use url::Url;

pub const ORIGIN: &str = "https://app.example.com";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn abs(path: &str) -> String {
    url(path).to_string()
}

pub struct Harness {
    pub registration: Arc<Registration>,
    pub fetcher: Arc<MockFetcher>,
    pub clock: Arc<ManualClock>,
    pub caches: Arc<CacheStorage>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let caches = Arc::new(CacheStorage::new(
            Arc::new(MemoryBackend::new()),
            clock.clone(),
        ));
        let fetcher = Arc::new(MockFetcher::new());
        fetcher
            .respond(&abs("/index.html"), 200, "<html>shell v1</html>")
            .respond(&abs("/offline.html"), 200, "<html>offline</html>")
            .respond(&abs("/app.js"), 200, "console.log(1)");

        let ctx = WorkerContext::new(Arc::clone(&caches), fetcher.clone());
        let registration = Arc::new(Registration::new(url("/"), ctx));
        Self {
            registration,
            fetcher,
            clock,
            caches,
        }
    }
}

pub fn config(version: &str) -> WorkerConfig {
    WorkerConfig {
        version: version.to_string(),
        ..WorkerConfig::for_origin(url("/"))
    }
}

pub fn script(version: &str, index_revision: &str) -> WorkerScript {
    let manifest = PrecacheManifest::from_json(&format!(
        r#"[
            {{"url": "/index.html", "revision": "{index_revision}"}},
            {{"url": "/app.js", "revision": "{version}"}}
        ]"#
    ))
    .unwrap();
    WorkerScript::new(config(version), manifest)
}
