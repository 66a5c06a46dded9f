//! Worker runtime and event dispatch.

use std::sync::Arc;

use bytes::Bytes;
use harbor_cache::CacheStorage;
use harbor_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::precache::{Precache, PrecacheManifest, PrecacheReport};
use crate::push::{Notification, NotificationId, Notifications, PushPayload};
use crate::router::{CachePolicy, RouteDecision, Router, Strategy};
use crate::strategy::{StrategyEngine, StrategyResponse};
use crate::version::CacheVersion;
use crate::{ServiceWorkerError, ServiceWorkerId};

/// Everything one worker version is built from.
#[derive(Debug, Clone)]
pub struct WorkerScript {
    pub config: WorkerConfig,
    pub manifest: PrecacheManifest,
}

impl WorkerScript {
    pub fn new(config: WorkerConfig, manifest: PrecacheManifest) -> Self {
        Self { config, manifest }
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }
}

/// State shared by every worker of a registration.
#[derive(Clone)]
pub struct WorkerContext {
    pub caches: Arc<CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clients: Arc<RwLock<Clients>>,
    pub notifications: Arc<RwLock<Notifications>>,
}

impl WorkerContext {
    pub fn new(caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            caches,
            fetcher,
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
        }
    }
}

/// Commands a page can post to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
    GetVersion,
}

/// Events delivered to a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    /// Activation; versioned caches of `retain_versions` survive cleanup.
    Activate { retain_versions: Vec<CacheVersion> },
    Fetch(Request),
    Message(WorkerMessage),
    Push(Option<Bytes>),
    NotificationClick(NotificationId),
}

impl WorkerEvent {
    fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate { .. } => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick(_) => "notificationclick",
        }
    }
}

/// Result of activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    /// Versioned caches of other versions that were deleted.
    pub deleted_caches: Vec<String>,
    /// Clients that switched to this worker.
    pub claimed: usize,
}

/// Result of handling one event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(PrecacheReport),
    Activated(ActivationReport),
    Response(StrategyResponse),
    /// The worker asked to skip the waiting phase.
    SkipWaiting,
    Version(String),
    NotificationShown(Notification),
    ClientFocused(Client),
    WindowOpened(Client),
    Ignored,
}

/// One worker version.
pub struct WorkerRuntime {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    precache: Arc<Precache>,
    router: Router,
    engine: StrategyEngine,
    app_shell: Option<Url>,
    ctx: WorkerContext,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .finish()
    }
}

impl WorkerRuntime {
    /// Build a worker from its script. Fails on invalid configuration.
    pub fn new(
        id: ServiceWorkerId,
        script: WorkerScript,
        ctx: WorkerContext,
    ) -> Result<Self, ServiceWorkerError> {
        script.config.validate()?;
        let app_shell = match script.config.app_shell_url {
            Some(ref shell) => Some(script.config.resolve(shell)?),
            None => None,
        };

        let config = Arc::new(script.config);
        let precache = Arc::new(Precache::new(&config, &script.manifest)?);
        let router = Router::new(Arc::clone(&config), Arc::clone(&precache));
        let engine = StrategyEngine::new(Arc::clone(&ctx.caches), Arc::clone(&ctx.fetcher));

        Ok(Self {
            id,
            config,
            precache,
            router,
            engine,
            app_shell,
            ctx,
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn version(&self) -> CacheVersion {
        self.config.cache_version()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle one event.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        debug!(worker = %self.id, event = event.name(), "Dispatching event");
        match event {
            WorkerEvent::Install => self.on_install().await,
            WorkerEvent::Activate { retain_versions } => self.on_activate(&retain_versions).await,
            WorkerEvent::Fetch(request) => self.on_fetch(request).await,
            WorkerEvent::Message(message) => Ok(self.on_message(message)),
            WorkerEvent::Push(data) => self.on_push(data).await,
            WorkerEvent::NotificationClick(id) => self.on_notification_click(id).await,
        }
    }

    async fn on_install(&self) -> Result<EventOutcome, ServiceWorkerError> {
        let report = self
            .precache
            .install(self.ctx.fetcher.as_ref(), &self.ctx.caches)
            .await?;
        Ok(EventOutcome::Installed(report))
    }

    async fn on_activate(&self, retain: &[CacheVersion]) -> Result<EventOutcome, ServiceWorkerError> {
        let version = self.version();
        let mut report = ActivationReport::default();

        match self.ctx.caches.keys().await {
            Ok(names) => {
                for name in names {
                    if !version.is_stale(&name) || retain.iter().any(|v| v.owns(&name)) {
                        continue;
                    }
                    match self.ctx.caches.delete(&name).await {
                        Ok(_) => report.deleted_caches.push(name),
                        Err(e) => warn!(cache = %name, error = %e, "Cannot delete outdated cache"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Cannot list caches for cleanup"),
        }

        report.claimed = self.ctx.clients.write().await.claim(self.id);
        info!(
            worker = %self.id,
            version = %version,
            deleted = report.deleted_caches.len(),
            claimed = report.claimed,
            "Worker activated"
        );
        Ok(EventOutcome::Activated(report))
    }

    async fn on_fetch(&self, request: Request) -> Result<EventOutcome, ServiceWorkerError> {
        let response = match self.router.classify(&request) {
            RouteDecision::Precached { key, .. } => {
                self.engine.precached(&request, &self.precache, &key).await?
            }
            RouteDecision::Navigation { app_shell } => {
                let shell = self.app_shell.as_ref().filter(|_| app_shell);
                self.engine.navigate(&request, &self.precache, shell).await?
            }
            RouteDecision::Cached(policy) => self.serve_runtime(&request, &policy).await?,
            RouteDecision::NetworkOnly => self.engine.network_only(&request).await?,
        };
        Ok(EventOutcome::Response(response))
    }

    async fn serve_runtime(
        &self,
        request: &Request,
        policy: &CachePolicy,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        match policy.strategy {
            Strategy::CacheFirst => self.engine.cache_first(request, policy).await,
            Strategy::StaleWhileRevalidate => {
                self.engine.stale_while_revalidate(request, policy).await
            }
            Strategy::NetworkOnly | Strategy::PrecachedMatch => {
                warn!(
                    cache = %policy.cache_name,
                    strategy = ?policy.strategy,
                    "Runtime cache with a non-caching strategy, using network"
                );
                self.engine.network_only(request).await
            }
        }
    }

    fn on_message(&self, message: WorkerMessage) -> EventOutcome {
        match message {
            WorkerMessage::SkipWaiting => EventOutcome::SkipWaiting,
            WorkerMessage::GetVersion => EventOutcome::Version(self.config.version.clone()),
        }
    }

    async fn on_push(&self, data: Option<Bytes>) -> Result<EventOutcome, ServiceWorkerError> {
        let payload = PushPayload::decode(data.as_deref());
        let notification = self.ctx.notifications.write().await.show(payload);
        Ok(EventOutcome::NotificationShown(notification))
    }

    async fn on_notification_click(
        &self,
        id: NotificationId,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let Some(notification) = self.ctx.notifications.write().await.close(id) else {
            debug!(notification = %id, "Click on unknown notification");
            return Ok(EventOutcome::Ignored);
        };

        let target = match self.config.resolve(&notification.url) {
            Ok(url) => url,
            Err(e) => {
                debug!(url = %notification.url, error = %e, "Bad notification url, opening origin");
                self.config.origin.clone()
            }
        };

        let (client, opened) = self.ctx.clients.write().await.focus_or_open(&target)?;
        if opened {
            Ok(EventOutcome::WindowOpened(client))
        } else {
            Ok(EventOutcome::ClientFocused(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ResponseSource;
    use harbor_net::mock::MockFetcher;

    const ORIGIN: &str = "https://app.example.com";

    fn script(version: &str) -> WorkerScript {
        let config = WorkerConfig {
            version: version.to_string(),
            ..WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
        };
        let manifest =
            PrecacheManifest::from_json(r#"[{"url": "/index.html", "revision": "1"}]"#).unwrap();
        WorkerScript::new(config, manifest)
    }

    fn runtime(version: &str) -> (WorkerRuntime, Arc<MockFetcher>, WorkerContext) {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher
            .respond(&format!("{ORIGIN}/index.html"), 200, "shell")
            .respond(&format!("{ORIGIN}/offline.html"), 200, "offline");
        let ctx = WorkerContext::new(Arc::new(CacheStorage::in_memory()), fetcher.clone());
        let runtime = WorkerRuntime::new(ServiceWorkerId::new(), script(version), ctx.clone()).unwrap();
        (runtime, fetcher, ctx)
    }

    #[test]
    fn test_message_wire_format() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::SkipWaiting);
        assert_eq!(
            serde_json::to_string(&WorkerMessage::GetVersion).unwrap(),
            r#"{"type":"GET_VERSION"}"#
        );
    }

    #[tokio::test]
    async fn test_install_then_fetch_precached() {
        let (runtime, fetcher, _) = runtime("1");
        assert!(matches!(
            runtime.dispatch(WorkerEvent::Install).await.unwrap(),
            EventOutcome::Installed(_)
        ));

        let request = Request::navigate(Url::parse(&format!("{ORIGIN}/")).unwrap());
        match runtime.dispatch(WorkerEvent::Fetch(request)).await.unwrap() {
            EventOutcome::Response(r) => {
                assert_eq!(r.source, ResponseSource::Precache);
                assert_eq!(r.response.body.as_ref(), b"shell");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fetcher.calls(&format!("{ORIGIN}/index.html")), 1);
    }

    #[tokio::test]
    async fn test_precached_navigation_falls_back_to_offline_page() {
        let (runtime, fetcher, ctx) = runtime("1");
        runtime.dispatch(WorkerEvent::Install).await.unwrap();
        ctx.caches.delete("harbor-precache-1").await.unwrap();
        fetcher.set_offline(true);

        let request = Request::navigate(Url::parse(&format!("{ORIGIN}/")).unwrap());
        match runtime.dispatch(WorkerEvent::Fetch(request)).await.unwrap() {
            EventOutcome::Response(r) => {
                assert_eq!(r.source, ResponseSource::OfflineFallback);
                assert_eq!(r.response.body.as_ref(), b"offline");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let asset = Request::get(Url::parse(&format!("{ORIGIN}/index.html")).unwrap());
        assert!(matches!(
            runtime.dispatch(WorkerEvent::Fetch(asset)).await,
            Err(ServiceWorkerError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_policy_without_caching_strategy_uses_network() {
        let (runtime, fetcher, ctx) = runtime("1");
        let url = format!("{ORIGIN}/img/a.png");
        fetcher.respond(&url, 200, "png");
        let policy = CachePolicy {
            strategy: Strategy::NetworkOnly,
            cache_name: "images".to_string(),
            expiration: Default::default(),
            cacheable_statuses: vec![200],
        };

        let request = Request::get(Url::parse(&url).unwrap());
        let response = runtime.serve_runtime(&request, &policy).await.unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert!(!ctx.caches.has("images").await.unwrap());
    }

    #[tokio::test]
    async fn test_activate_deletes_only_other_versions() {
        let (runtime, _, ctx) = runtime("2");
        for name in [
            "harbor-precache-1",
            "harbor-offline-1",
            "harbor-precache-3",
            "images",
        ] {
            ctx.caches.open(name).await.unwrap();
        }
        runtime.dispatch(WorkerEvent::Install).await.unwrap();
        ctx.clients
            .write()
            .await
            .open_window(Url::parse(ORIGIN).unwrap());

        let outcome = runtime
            .dispatch(WorkerEvent::Activate {
                retain_versions: vec![CacheVersion::new("3")],
            })
            .await
            .unwrap();

        let EventOutcome::Activated(report) = outcome else {
            panic!("expected activation report");
        };
        assert_eq!(report.deleted_caches, vec!["harbor-precache-1", "harbor-offline-1"]);
        assert_eq!(report.claimed, 1);

        let mut remaining = ctx.caches.keys().await.unwrap();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["harbor-offline-2", "harbor-precache-2", "harbor-precache-3", "images"]
        );
    }

    #[tokio::test]
    async fn test_get_version_message() {
        let (runtime, _, _) = runtime("7");
        match runtime
            .dispatch(WorkerEvent::Message(WorkerMessage::GetVersion))
            .await
            .unwrap()
        {
            EventOutcome::Version(v) => assert_eq!(v, "7"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_then_click_opens_window() {
        let (runtime, _, ctx) = runtime("1");
        let outcome = runtime
            .dispatch(WorkerEvent::Push(Some(Bytes::from_static(
                br#"{"title":"Deploy","url":"/deploys/9"}"#,
            ))))
            .await
            .unwrap();
        let EventOutcome::NotificationShown(notification) = outcome else {
            panic!("expected a notification");
        };
        assert_eq!(notification.title, "Deploy");

        let clicked = runtime
            .dispatch(WorkerEvent::NotificationClick(notification.id))
            .await
            .unwrap();
        match clicked {
            EventOutcome::WindowOpened(client) => {
                assert_eq!(client.url.as_str(), format!("{ORIGIN}/deploys/9"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(ctx.notifications.read().await.list().is_empty());

        // A second click on the closed notification does nothing.
        assert!(matches!(
            runtime
                .dispatch(WorkerEvent::NotificationClick(notification.id))
                .await
                .unwrap(),
            EventOutcome::Ignored
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut bad = script("1");
        bad.config.version = String::new();
        let ctx = WorkerContext::new(
            Arc::new(CacheStorage::in_memory()),
            Arc::new(MockFetcher::new()),
        );
        assert!(matches!(
            WorkerRuntime::new(ServiceWorkerId::new(), bad, ctx),
            Err(ServiceWorkerError::Config(_))
        ));
    }
}
