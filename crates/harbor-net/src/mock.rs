//! Scripted in-memory [`Fetcher`] for tests.
//!
//! Unknown URLs answer 404 like a real origin would; `fail` and
//! `set_offline` simulate transport errors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Default)]
struct Script {
    routes: HashMap<String, (u16, Bytes)>,
    failing: HashSet<String>,
    calls: HashMap<String, usize>,
    delay: Option<Duration>,
}

/// A fetcher answering from a table of canned responses.
#[derive(Default)]
pub struct MockFetcher {
    script: Mutex<Script>,
    offline: AtomicBool,
    total: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.script()
            .routes
            .insert(url.to_string(), (status, body.into()));
        self
    }

    /// Make every request for `url` fail with a transport error.
    pub fn fail(&self, url: &str) -> &Self {
        self.script().failing.insert(url.to_string());
        self
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        self.script().delay = Some(delay);
    }

    /// Number of fetches issued for `url`, including failed ones.
    pub fn calls(&self, url: &str) -> usize {
        self.script().calls.get(url).copied().unwrap_or(0)
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.total.fetch_add(1, Ordering::SeqCst);

        let (delay, failing, route) = {
            let mut script = self.script();
            *script.calls.entry(url.clone()).or_insert(0) += 1;
            (
                script.delay,
                script.failing.contains(&url),
                script.routes.get(&url).cloned(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) || failing {
            return Err(NetError::Offline(url));
        }

        Ok(match route {
            Some((status, body)) => Response::new(request.url.clone(), status, body),
            None => Response::new(request.url.clone(), 404, Bytes::new()),
        })
    }
}
