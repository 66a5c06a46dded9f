//! Window and worker clients of the origin.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::{ServiceWorkerError, ServiceWorkerId};

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A page or worker of the origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: ClientId,

    /// Current document URL.
    pub url: Url,

    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// A new, uncontrolled window at `url`.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    pub fn is_controlled_by(&self, worker: ServiceWorkerId) -> bool {
        self.controller == Some(worker)
    }
}

// ==================== Clients ====================

/// The clients registry of one origin.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// All clients of a type, ordered by id.
    pub fn match_all(&self, client_type: ClientType) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| c.client_type == client_type)
            .collect();
        matched.sort_by_key(|c| c.id);
        matched
    }

    /// Number of clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Open a focused window at `url`.
    pub fn open_window(&mut self, url: Url) -> Client {
        self.unfocus_all();
        let mut client = Client::window(url);
        client.focused = true;
        debug!(client = %client.id, url = %client.url, "Opened window");
        self.clients.insert(client.id, client.clone());
        client
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: ClientId) -> Result<Client, ServiceWorkerError> {
        let client_type = self
            .clients
            .get(&id)
            .map(|c| c.client_type)
            .ok_or_else(|| ServiceWorkerError::StateError(format!("unknown client {id}")))?;
        if client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        self.unfocus_all();
        let client = self
            .clients
            .get_mut(&id)
            .ok_or_else(|| ServiceWorkerError::StateError(format!("unknown client {id}")))?;
        client.focused = true;
        Ok(client.clone())
    }

    /// Focus the window already showing `url`, or open one there.
    ///
    /// Returns the client and whether a new window was opened.
    pub fn focus_or_open(&mut self, url: &Url) -> Result<(Client, bool), ServiceWorkerError> {
        let existing = self
            .match_all(ClientType::Window)
            .into_iter()
            .find(|c| same_document(&c.url, url))
            .map(|c| c.id);

        match existing {
            Some(id) => Ok((self.focus(id)?, false)),
            None => Ok((self.open_window(url.clone()), true)),
        }
    }

    /// Make `worker` the controller of every client. Returns how many
    /// clients changed controller.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        claimed
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id, client);
    }

    fn unfocus_all(&mut self) {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
    }
}

fn same_document(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}
