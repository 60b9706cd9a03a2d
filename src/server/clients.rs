//! Client tracking for one published context.

use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::graph::GraphHandle;

/// Opaque identifier for a remote client connected to a published context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Minted by the accept layer for each upgraded socket.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observer of client membership changes under one published context.
pub trait ClientListener: Send + Sync {
    fn client_connected(&self, id: &ClientId);
    fn client_disconnected(&self, id: &ClientId);
}

/// Tracks which remote clients are currently connected under one published
/// context and broadcasts every membership change to all registered
/// listeners. A rapid disconnect/reconnect surfaces as two events.
pub struct ClientRegistry {
    clients: DashSet<ClientId>,
    listeners: RwLock<Vec<Arc<dyn ClientListener>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashSet::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.listeners.write().push(listener);
    }

    /// Invoked by the accept layer when a remote peer connects.
    pub fn client_connected(&self, id: &ClientId) {
        self.clients.insert(id.clone());
        debug!(client = %id, "client connected");
        for listener in self.listeners_snapshot() {
            listener.client_connected(id);
        }
    }

    /// Invoked by the accept layer when a remote peer goes away.
    pub fn client_disconnected(&self, id: &ClientId) {
        self.clients.remove(id);
        debug!(client = %id, "client disconnected");
        for listener in self.listeners_snapshot() {
            listener.client_disconnected(id);
        }
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn ClientListener>> {
        self.listeners.read().clone()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The graph a master exposes under one context, together with the client
/// registry reporting who is consuming it.
pub struct ServerController {
    graph: GraphHandle,
    clients: ClientRegistry,
}

impl ServerController {
    pub fn new(graph: GraphHandle) -> Self {
        Self {
            graph,
            clients: ClientRegistry::new(),
        }
    }

    pub fn graph(&self) -> &GraphHandle {
        &self.graph
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }
}
