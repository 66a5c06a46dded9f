//! Foreground update prompt for one tab.
//!
//! ```text
//! NoUpdate ──check──→ UpdateAvailable ──accept──→ Updating ──controller change──→ reload
//!                          │
//!                       dismiss
//!                          ▼
//!                      Dismissed ──next poll──→ NoUpdate
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::lifecycle::Registration;
use crate::worker::WorkerMessage;
use crate::{ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId};

/// What the tab shows about updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    #[default]
    NoUpdate,
    UpdateAvailable,
    Updating,
    Dismissed,
}

/// Tells the tab to reload under the new controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadDirective {
    pub new_controller: ServiceWorkerId,
}

/// Per-tab observer of a registration.
pub struct UpdateNotifier {
    registration: Arc<Registration>,
    events: broadcast::Receiver<ServiceWorkerEvent>,
    state: UpdateState,
    waiting: Option<ServiceWorkerId>,
    interval: Duration,
    last_poll: Option<Instant>,
    reloaded: bool,
}

impl UpdateNotifier {
    /// Subscribes to the registration right away, so a controller change
    /// fired after this call is never missed. Changes buffered before
    /// [`accept`](Self::accept) are discarded there.
    pub fn new(registration: Arc<Registration>, interval: Duration) -> Self {
        let events = registration.subscribe();
        Self {
            registration,
            events,
            state: UpdateState::NoUpdate,
            waiting: None,
            interval,
            last_poll: None,
            reloaded: false,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Worker the prompt refers to.
    pub fn waiting_worker(&self) -> Option<ServiceWorkerId> {
        self.waiting
    }

    /// Look at the registration's waiting slot. A dismissed or in-progress
    /// prompt is left alone.
    pub async fn check(&mut self) -> UpdateState {
        if matches!(self.state, UpdateState::Dismissed | UpdateState::Updating) {
            return self.state;
        }

        self.waiting = self.registration.waiting().await.map(|w| w.id);
        self.state = match self.waiting {
            Some(_) => UpdateState::UpdateAvailable,
            None => UpdateState::NoUpdate,
        };
        debug!(state = ?self.state, waiting = ?self.waiting, "Update check");
        self.state
    }

    /// Start a new poll cycle. Clears a dismissal, then checks.
    pub async fn poll(&mut self) -> UpdateState {
        self.last_poll = Some(Instant::now());
        if self.state == UpdateState::Dismissed {
            self.state = UpdateState::NoUpdate;
        }
        self.check().await
    }

    /// Whether the poll interval elapsed since the last poll.
    pub fn poll_due(&self) -> bool {
        match self.last_poll {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Hide the prompt until the next poll cycle.
    pub fn dismiss(&mut self) {
        if self.state == UpdateState::UpdateAvailable {
            self.state = UpdateState::Dismissed;
        }
    }

    /// Ask the waiting worker to take over.
    pub async fn accept(&mut self) -> Result<(), ServiceWorkerError> {
        let Some(target) = self.waiting.filter(|_| self.state == UpdateState::UpdateAvailable) else {
            return Err(ServiceWorkerError::StateError(format!(
                "no update to accept in state {:?}",
                self.state
            )));
        };

        let stale = self.drain_events();
        if stale > 0 {
            debug!(stale, "Discarded lifecycle events from before the update was accepted");
        }

        info!(worker = %target, "Update accepted, asking worker to skip waiting");
        self.registration
            .post_message(target, WorkerMessage::SkipWaiting)
            .await?;
        self.state = UpdateState::Updating;
        Ok(())
    }

    fn drain_events(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.events.try_recv() {
                Ok(_) => drained += 1,
                Err(TryRecvError::Lagged(skipped)) => drained += skipped as usize,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
            }
        }
    }

    /// Wait for the next controller change. Only the first one is ever
    /// reported; afterwards this returns an error.
    pub async fn wait_for_controller_change(&mut self) -> Result<ReloadDirective, ServiceWorkerError> {
        if self.reloaded {
            return Err(ServiceWorkerError::StateError(
                "controller change already handled".to_string(),
            ));
        }

        loop {
            match self.events.recv().await {
                Ok(ServiceWorkerEvent::ControllerChange { worker_id }) => {
                    self.reloaded = true;
                    info!(worker = %worker_id, "Controller changed, reloading");
                    return Ok(ReloadDirective {
                        new_controller: worker_id,
                    });
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Update notifier lagged behind lifecycle events");
                }
                Err(RecvError::Closed) => {
                    return Err(ServiceWorkerError::StateError(
                        "registration dropped".to_string(),
                    ));
                }
            }
        }
    }
}
