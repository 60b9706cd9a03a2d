//! Per-workspace session state.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::connection::{Connection, ConnectionStatus};
use crate::server::ClientId;
use crate::workspace::ServerContext;

struct ModelState {
    connections: Vec<Arc<Connection>>,
    master_running: bool,
    server_context: Option<ServerContext>,
    connected_clients: HashSet<ClientId>,
}

/// Aggregate state of one workspace's streaming activity: its open outbound
/// connections, whether it is publishing as master, and the remote clients
/// consuming its published context.
///
/// All fields sit behind one lock; mutations are linearizable. Mutators are
/// meant to be called by the `SessionController` only (single-writer
/// discipline), readers may be anywhere.
///
/// Invariant: `server_context` is set exactly while `master_running` is true,
/// and `connected_clients` is empty and frozen while it is false.
pub struct SessionModel {
    state: Mutex<ModelState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub endpoint: String,
    pub status: ConnectionStatus,
}

/// Point-in-time copy of a model, for display layers.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub master_running: bool,
    pub server_context: Option<String>,
    pub connected_clients: Vec<String>,
    pub connections: Vec<ConnectionSnapshot>,
}

impl SessionModel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ModelState {
                connections: Vec::new(),
                master_running: false,
                server_context: None,
                connected_clients: HashSet::new(),
            }),
        }
    }

    pub fn add_connection(&self, connection: Arc<Connection>) {
        self.state.lock().connections.push(connection);
    }

    /// Drop `connection` from the model. Returns whether it was held.
    pub fn remove_connection(&self, connection: &Arc<Connection>) -> bool {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state
            .connections
            .retain(|held| !Arc::ptr_eq(held, connection));
        state.connections.len() != before
    }

    /// Close and discard every held connection.
    pub fn remove_all_connections(&self) {
        // Closing runs observer callbacks synchronously; drain first so the
        // model lock is not held while they run.
        let connections = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.connections)
        };
        for connection in connections {
            connection.close();
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().connections.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Flip master state. `Some(context)` marks the master running under
    /// that context; `None` stops it, clearing the context and the connected
    /// client set in the same step.
    pub fn set_master(&self, context: Option<ServerContext>) {
        let mut state = self.state.lock();
        match context {
            Some(context) => {
                state.master_running = true;
                state.server_context = Some(context);
            }
            None => {
                state.master_running = false;
                state.server_context = None;
                state.connected_clients.clear();
            }
        }
    }

    pub fn master_running(&self) -> bool {
        self.state.lock().master_running
    }

    pub fn server_context(&self) -> Option<ServerContext> {
        self.state.lock().server_context.clone()
    }

    /// Record a remote client under the published context. Dropped while the
    /// master is not running, which makes late registry callbacks after
    /// `stop_master` harmless.
    pub fn add_connected(&self, id: &ClientId) {
        let mut state = self.state.lock();
        if state.master_running {
            state.connected_clients.insert(id.clone());
        }
    }

    pub fn remove_connected(&self, id: &ClientId) {
        self.state.lock().connected_clients.remove(id);
    }

    pub fn connected_clients(&self) -> HashSet<ClientId> {
        self.state.lock().connected_clients.clone()
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        let state = self.state.lock();
        ModelSnapshot {
            master_running: state.master_running,
            server_context: state.server_context.as_ref().map(|c| c.to_string()),
            connected_clients: state
                .connected_clients
                .iter()
                .map(|c| c.to_string())
                .collect(),
            connections: state
                .connections
                .iter()
                .map(|c| ConnectionSnapshot {
                    endpoint: c.endpoint().to_string(),
                    status: c.status(),
                })
                .collect(),
        }
    }
}

impl Default for SessionModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_state_pairs_context_with_running() {
        let model = SessionModel::new();
        assert!(!model.master_running());
        assert!(model.server_context().is_none());

        model.set_master(Some(ServerContext::derive("Team Graph")));
        assert!(model.master_running());
        assert_eq!(model.server_context().unwrap().as_str(), "/teamgraph");

        model.set_master(None);
        assert!(!model.master_running());
        assert!(model.server_context().is_none());
    }

    #[test]
    fn stopping_master_clears_clients() {
        let model = SessionModel::new();
        model.set_master(Some(ServerContext::derive("g")));
        let id = ClientId::new();
        model.add_connected(&id);
        assert_eq!(model.connected_clients().len(), 1);

        model.set_master(None);
        assert!(model.connected_clients().is_empty());
    }

    #[test]
    fn client_events_ignored_while_not_running() {
        let model = SessionModel::new();
        let id = ClientId::new();
        model.add_connected(&id);
        assert!(model.connected_clients().is_empty());

        // A late disconnect for an id never held is harmless too.
        model.remove_connected(&id);
        assert!(model.connected_clients().is_empty());
    }
}
