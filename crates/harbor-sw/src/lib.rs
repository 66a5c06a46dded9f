//! # Harbor Service Worker
//!
//! Offline caching and live-update coordination for a single origin.
//!
//! ## Features
//!
//! - **Strategies**: CacheFirst, StaleWhileRevalidate, NetworkOnly and
//!   precache matching, selected per request class
//! - **Precache**: versioned, all-or-nothing install of build artifacts
//! - **Lifecycle**: install → waiting → activate → controlling, with
//!   skip-waiting and immediate client claim
//! - **Update hand-off**: foreground notifier, skip-waiting command and a
//!   single controller-change signal per activation
//! - **Push**: defensive payload decoding and notification-click routing
//!
//! ## Architecture
//!
//! ```text
//! Registration (one per origin, owns the lifecycle state register)
//!     ├── installing (ServiceWorker → WorkerRuntime)
//!     ├── waiting    (ServiceWorker → WorkerRuntime)
//!     ├── active     (ServiceWorker → WorkerRuntime)
//!     └── events ──── broadcast ───→ UpdateNotifier (per tab)
//!
//! WorkerRuntime::dispatch(WorkerEvent)
//!     ├── Install  → Precache
//!     ├── Activate → stale cache cleanup + Clients::claim
//!     ├── Fetch    → Router → StrategyEngine → CacheStorage / Fetcher
//!     ├── Message  → SkipWaiting / GetVersion
//!     └── Push / NotificationClick → Notifications / Clients
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use harbor_cache::CacheError;
use harbor_common::HarborError;
use harbor_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod clients;
pub mod config;
pub mod lifecycle;
pub mod notifier;
pub mod precache;
pub mod push;
pub mod router;
pub mod strategy;
pub mod version;
pub mod worker;

pub use clients::{Client, ClientId, ClientType, Clients};
pub use config::{RuntimeCacheConfig, WorkerConfig};
pub use lifecycle::{Registration, WorkerInfo};
pub use notifier::{ReloadDirective, UpdateNotifier, UpdateState};
pub use precache::{Precache, PrecacheEntry, PrecacheManifest, PrecacheReport};
pub use push::{Notification, NotificationId, Notifications, PushPayload};
pub use router::{CachePolicy, RouteDecision, Router, Strategy};
pub use strategy::{ResponseSource, StrategyEngine, StrategyResponse};
pub use version::CacheVersion;
pub use worker::{
    ActivationReport, EventOutcome, WorkerContext, WorkerEvent, WorkerMessage, WorkerRuntime,
    WorkerScript,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed at {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Install of worker {0} was superseded by a newer install")]
    Superseded(ServiceWorkerId),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),
}

impl From<ServiceWorkerError> for HarborError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            ServiceWorkerError::Cache(e) => e.into(),
            ServiceWorkerError::Config(msg) => HarborError::config(msg),
            other => HarborError::lifecycle_with_source("worker lifecycle", other),
        }
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started yet.
    #[default]
    Parsed,
    /// Precaching build artifacts.
    Installing,
    /// Installed and waiting for the current controller to give way.
    Installed,
    /// Cleaning up and claiming clients.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or failed; never used again.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether fetches may be routed through a worker in this state.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Events broadcast by a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker moved to a new state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// A new worker took control of the origin's clients.
    ControllerChange { worker_id: ServiceWorkerId },
}
