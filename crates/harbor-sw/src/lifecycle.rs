//! Registration: the lifecycle state register of one origin.
//!
//! A registration owns three slots (installing, waiting, active) and the
//! state of every worker it ever created. Transitions only happen here, under
//! the slot lock, so a worker can never be in two slots and a redundant
//! worker never comes back.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use harbor_net::Request;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, ClientId, Clients};
use crate::push::NotificationId;
use crate::strategy::{ResponseSource, StrategyResponse};
use crate::worker::{
    EventOutcome, WorkerContext, WorkerEvent, WorkerMessage, WorkerRuntime, WorkerScript,
};
use crate::{ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState};

const EVENT_CAPACITY: usize = 64;

/// Snapshot of a worker for callers outside the registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: ServiceWorkerId,
    pub version: String,
    pub state: ServiceWorkerState,
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<WorkerRuntime>>,
    waiting: Option<Arc<WorkerRuntime>>,
    active: Option<Arc<WorkerRuntime>>,
    states: HashMap<ServiceWorkerId, ServiceWorkerState>,
    /// Installing workers that asked to skip waiting before they finished.
    skip_requested: HashSet<ServiceWorkerId>,
}

impl Slots {
    fn find(&self, id: ServiceWorkerId) -> Option<&Arc<WorkerRuntime>> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id() == id)
    }

    fn live_versions(&self) -> Vec<String> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .map(|w| w.config().version.clone())
            .collect()
    }
}

/// One origin's worker registration.
pub struct Registration {
    scope: Url,
    ctx: WorkerContext,
    slots: RwLock<Slots>,
    events: broadcast::Sender<ServiceWorkerEvent>,
}

impl Registration {
    pub fn new(scope: Url, ctx: WorkerContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scope,
            ctx,
            slots: RwLock::new(Slots::default()),
            events,
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.ctx.clients)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceWorkerEvent> {
        self.events.subscribe()
    }

    pub async fn installing(&self) -> Option<WorkerInfo> {
        let slots = self.slots.read().await;
        slots.installing.as_ref().map(|w| info_of(&slots, w))
    }

    pub async fn waiting(&self) -> Option<WorkerInfo> {
        let slots = self.slots.read().await;
        slots.waiting.as_ref().map(|w| info_of(&slots, w))
    }

    pub async fn active(&self) -> Option<WorkerInfo> {
        let slots = self.slots.read().await;
        slots.active.as_ref().map(|w| info_of(&slots, w))
    }

    /// Last known state of any worker this registration created.
    pub async fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.slots.read().await.states.get(&id).copied()
    }

    /// A page of the origin loaded. It starts out controlled by the active
    /// worker, if there is one.
    pub async fn connect_client(&self, url: Url) -> Client {
        let controller = self.slots.read().await.active.as_ref().map(|w| w.id());
        let mut clients = self.ctx.clients.write().await;
        let mut client = clients.open_window(url);
        client.controller = controller;
        clients.add(client.clone());
        client
    }

    /// Install a new worker version.
    ///
    /// The install runs without holding the slot lock. When it finishes the
    /// worker only moves on if it still owns the installing slot; otherwise a
    /// newer install superseded it and it is already redundant.
    pub async fn update(&self, script: WorkerScript) -> Result<WorkerInfo, ServiceWorkerError> {
        let id = ServiceWorkerId::new();
        let runtime = Arc::new(WorkerRuntime::new(id, script, self.ctx.clone())?);

        {
            let mut slots = self.slots.write().await;
            if let Some(previous) = slots.installing.replace(Arc::clone(&runtime)) {
                info!(worker = %previous.id(), by = %id, "Install superseded");
                self.set_state(&mut slots, &previous, ServiceWorkerState::Redundant);
            }
            slots.states.insert(id, ServiceWorkerState::Parsed);
            let _ = self.events.send(ServiceWorkerEvent::UpdateFound { worker_id: id });
            self.set_state(&mut slots, &runtime, ServiceWorkerState::Installing);
        }

        let result = runtime.dispatch(WorkerEvent::Install).await;

        let mut slots = self.slots.write().await;
        let owns_slot = slots.installing.as_ref().is_some_and(|w| w.id() == id);
        if !owns_slot {
            slots.skip_requested.remove(&id);
            self.discard_caches(&slots, &runtime).await;
            return Err(ServiceWorkerError::Superseded(id));
        }
        slots.installing = None;

        if let Err(e) = result {
            warn!(worker = %id, error = %e, "Install failed, keeping current worker");
            slots.skip_requested.remove(&id);
            self.set_state(&mut slots, &runtime, ServiceWorkerState::Redundant);
            return Err(e);
        }

        self.set_state(&mut slots, &runtime, ServiceWorkerState::Installed);
        let skip = slots.skip_requested.remove(&id);
        if slots.active.is_none() || skip {
            let stale_waiting = slots.waiting.take();
            if let Some(ref previous) = stale_waiting {
                self.set_state(&mut slots, previous, ServiceWorkerState::Redundant);
            }
            self.activate(&mut slots, Arc::clone(&runtime)).await;
            if let Some(previous) = stale_waiting {
                self.discard_caches(&slots, &previous).await;
            }
        } else {
            if let Some(previous) = slots.waiting.replace(Arc::clone(&runtime)) {
                self.set_state(&mut slots, &previous, ServiceWorkerState::Redundant);
                self.discard_caches(&slots, &previous).await;
            }
            info!(worker = %id, "Worker installed, waiting for current worker to release");
        }

        Ok(info_of(&slots, &runtime))
    }

    /// Activate the waiting worker `target`. Returns whether it activated.
    ///
    /// Calling this for an installing worker makes it activate as soon as
    /// its install completes; any other target is a no-op.
    pub async fn skip_waiting(&self, target: ServiceWorkerId) -> Result<bool, ServiceWorkerError> {
        let mut slots = self.slots.write().await;

        if slots.waiting.as_ref().is_some_and(|w| w.id() == target) {
            if let Some(waiting) = slots.waiting.take() {
                self.activate(&mut slots, waiting).await;
                return Ok(true);
            }
        }

        if slots.installing.as_ref().is_some_and(|w| w.id() == target) {
            debug!(worker = %target, "Skip waiting requested during install");
            slots.skip_requested.insert(target);
        } else {
            debug!(worker = %target, state = ?slots.states.get(&target), "Skip waiting ignored");
        }
        Ok(false)
    }

    /// Post a command to a worker. Messages to unknown or redundant workers
    /// are dropped.
    pub async fn post_message(
        &self,
        target: ServiceWorkerId,
        message: WorkerMessage,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let runtime = self.slots.read().await.find(target).cloned();
        let Some(runtime) = runtime else {
            debug!(worker = %target, ?message, "Message to inactive worker dropped");
            return Ok(EventOutcome::Ignored);
        };

        let outcome = runtime.dispatch(WorkerEvent::Message(message)).await?;
        if let EventOutcome::SkipWaiting = outcome {
            self.skip_waiting(target).await?;
        }
        Ok(outcome)
    }

    /// Route a request from `client` through the active worker. Clients the
    /// active worker does not control (and any request made while no worker
    /// is active) go straight to the network.
    pub async fn fetch(
        &self,
        client: ClientId,
        request: Request,
    ) -> Result<StrategyResponse, ServiceWorkerError> {
        let active = self.slots.read().await.active.clone();
        let controlled = match active {
            Some(ref worker) if request.is_navigation() => Some(Arc::clone(worker)),
            Some(ref worker) => {
                let clients = self.ctx.clients.read().await;
                clients
                    .get(client)
                    .filter(|c| c.is_controlled_by(worker.id()))
                    .map(|_| Arc::clone(worker))
            }
            None => None,
        };

        let Some(worker) = controlled else {
            let response = self.ctx.fetcher.fetch(&request).await?;
            return Ok(StrategyResponse {
                response,
                source: ResponseSource::Network,
                revalidation: None,
            });
        };

        match worker.dispatch(WorkerEvent::Fetch(request)).await? {
            EventOutcome::Response(response) => Ok(response),
            other => Err(ServiceWorkerError::StateError(format!(
                "fetch produced {other:?}"
            ))),
        }
    }

    /// Deliver a push message to the active worker.
    pub async fn push(&self, data: Option<Bytes>) -> Result<EventOutcome, ServiceWorkerError> {
        self.dispatch_active(WorkerEvent::Push(data)).await
    }

    /// Deliver a notification click to the active worker.
    pub async fn notification_click(
        &self,
        id: NotificationId,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        self.dispatch_active(WorkerEvent::NotificationClick(id)).await
    }

    /// Make every worker redundant.
    pub async fn unregister(&self) {
        let mut slots = self.slots.write().await;
        let workers: Vec<Arc<WorkerRuntime>> = [
            slots.installing.take(),
            slots.waiting.take(),
            slots.active.take(),
        ]
        .into_iter()
        .flatten()
        .collect();
        slots.skip_requested.clear();

        for worker in workers {
            self.set_state(&mut slots, &worker, ServiceWorkerState::Redundant);
        }
        info!(scope = %self.scope, "Registration cleared");
    }

    async fn dispatch_active(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        let active = self.slots.read().await.active.clone();
        match active {
            Some(worker) => worker.dispatch(event).await,
            None => {
                debug!("No active worker, event dropped");
                Ok(EventOutcome::Ignored)
            }
        }
    }

    /// waiting/installed → activating → activated, replacing the current
    /// controller. Fires exactly one controller change.
    async fn activate(&self, slots: &mut Slots, runtime: Arc<WorkerRuntime>) {
        self.set_state(slots, &runtime, ServiceWorkerState::Activating);

        let retain_versions = slots
            .installing
            .iter()
            .map(|w| w.version())
            .collect();
        if let Err(e) = runtime
            .dispatch(WorkerEvent::Activate { retain_versions })
            .await
        {
            warn!(worker = %runtime.id(), error = %e, "Activate handler failed");
        }

        if let Some(previous) = slots.active.replace(Arc::clone(&runtime)) {
            self.set_state(slots, &previous, ServiceWorkerState::Redundant);
        }
        self.set_state(slots, &runtime, ServiceWorkerState::Activated);
        let _ = self.events.send(ServiceWorkerEvent::ControllerChange {
            worker_id: runtime.id(),
        });
    }

    fn set_state(&self, slots: &mut Slots, worker: &WorkerRuntime, state: ServiceWorkerState) {
        let previous = slots.states.insert(worker.id(), state);
        if previous == Some(state) {
            return;
        }
        info!(worker = %worker.id(), version = %worker.config().version, %state, "Worker state change");
        let _ = self.events.send(ServiceWorkerEvent::StateChange {
            worker_id: worker.id(),
            version: worker.config().version.clone(),
            new_state: state,
        });
    }

    /// Delete a dropped worker's versioned caches unless a live worker
    /// shares its version.
    async fn discard_caches(&self, slots: &Slots, worker: &WorkerRuntime) {
        let version = worker.version();
        if slots.live_versions().iter().any(|v| v == version.as_str()) {
            return;
        }
        for name in [version.precache_name(), version.offline_name()] {
            if let Err(e) = self.ctx.caches.delete(&name).await {
                warn!(cache = %name, error = %e, "Cannot delete caches of dropped worker");
            }
        }
    }
}

fn info_of(slots: &Slots, worker: &WorkerRuntime) -> WorkerInfo {
    WorkerInfo {
        id: worker.id(),
        version: worker.config().version.clone(),
        state: slots
            .states
            .get(&worker.id())
            .copied()
            .unwrap_or_default(),
    }
}
