//! Process-wide master publishing: the context table and the lifecycle of the
//! shared WebSocket listener.
//!
//! One registry serves every published context through a single listener.
//! Publishing binds a context name to a [`ServerController`]; the listener is
//! started lazily on the first publish and stopped when the last context is
//! unpublished. A settings change restarts the listener in place, a window
//! during which no context is reachable; published contexts stay registered
//! across the gap.

pub mod api;
pub mod clients;

pub use clients::{ClientId, ClientListener, ClientRegistry, ServerController};

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::PublishError;
use crate::workspace::ServerContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

struct ContextEntry {
    controller: Arc<ServerController>,
    /// Dropped clients: unpublish fires this and every in-flight socket task
    /// under the context winds down.
    shutdown: broadcast::Sender<()>,
}

struct ListenerTask {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
    local_addr: SocketAddr,
}

struct ListenerState {
    settings: ServerSettings,
    running: Option<ListenerTask>,
}

/// Process-wide table mapping published context names to their controllers,
/// plus the shared listener they are served through.
pub struct ServerRegistry {
    contexts: DashMap<String, ContextEntry>,
    /// Guards the listener lifecycle; publish/unpublish/settings changes are
    /// serialized through this lock.
    listener: tokio::sync::Mutex<ListenerState>,
    /// Shutdown fan-out reaching every live socket task when the listener
    /// goes down. Kept outside the async lock so the accept path never waits
    /// on listener lifecycle operations.
    conn_shutdown: parking_lot::Mutex<Option<broadcast::Sender<()>>>,
}

impl ServerRegistry {
    pub fn new(settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            contexts: DashMap::new(),
            listener: tokio::sync::Mutex::new(ListenerState {
                settings,
                running: None,
            }),
            conn_shutdown: parking_lot::Mutex::new(None),
        })
    }

    /// Bind `context` to `controller` and start serving it. Rejects with
    /// `ContextConflict` when the context is already published; the existing
    /// mapping is untouched.
    pub async fn publish(
        self: &Arc<Self>,
        context: ServerContext,
        controller: Arc<ServerController>,
    ) -> Result<(), PublishError> {
        use dashmap::mapref::entry::Entry;

        match self.contexts.entry(context.as_str().to_string()) {
            Entry::Occupied(_) => return Err(PublishError::ContextConflict(context)),
            Entry::Vacant(vacant) => {
                let (shutdown, _) = broadcast::channel(1);
                vacant.insert(ContextEntry {
                    controller,
                    shutdown,
                });
            }
        }

        if let Err(e) = self.ensure_listener().await {
            self.contexts.remove(context.as_str());
            return Err(e);
        }
        info!(context = %context, "context published");
        Ok(())
    }

    /// Remove the mapping and forcibly terminate in-flight remote sessions
    /// under `context`. Unpublishing a context that is not published is a
    /// no-op, surfaced in logs as a caller bug.
    pub async fn unpublish(&self, context: &ServerContext) {
        match self.contexts.remove(context.as_str()) {
            Some((_, entry)) => {
                let _ = entry.shutdown.send(());
                info!(context = %context, "context unpublished");
                if self.contexts.is_empty() {
                    self.stop_listener().await;
                }
            }
            None => warn!(context = %context, "unpublish of a context that is not published"),
        }
    }

    /// Apply new listener settings. If the listener is running it is stopped,
    /// reconfigured, and restarted; every connected client is dropped across
    /// the restart and no context is reachable during the gap.
    pub async fn apply_settings(self: &Arc<Self>, settings: ServerSettings) -> Result<(), PublishError> {
        let mut state = self.listener.lock().await;
        let was_running = state.running.is_some();
        if was_running {
            Self::halt(&mut state, &self.conn_shutdown).await;
        }
        state.settings = settings;
        if was_running {
            self.start_locked(&mut state).await?;
        }
        Ok(())
    }

    pub async fn settings(&self) -> ServerSettings {
        self.listener.lock().await.settings.clone()
    }

    /// Address the listener is bound to, if running. With a port-0 setting
    /// this is where the kernel-assigned port surfaces.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.running.as_ref().map(|t| t.local_addr)
    }

    pub fn is_published(&self, context: &ServerContext) -> bool {
        self.contexts.contains_key(context.as_str())
    }

    pub fn published_contexts(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolve a request path to its published controller and a shutdown
    /// receiver scoped to that context.
    pub(crate) fn lookup(
        &self,
        path: &str,
    ) -> Option<(Arc<ServerController>, broadcast::Receiver<()>)> {
        self.contexts
            .get(path)
            .map(|entry| (entry.controller.clone(), entry.shutdown.subscribe()))
    }

    pub(crate) fn conn_shutdown_rx(&self) -> Option<broadcast::Receiver<()>> {
        self.conn_shutdown.lock().as_ref().map(|tx| tx.subscribe())
    }

    async fn ensure_listener(self: &Arc<Self>) -> Result<(), PublishError> {
        let mut state = self.listener.lock().await;
        if state.running.is_some() {
            return Ok(());
        }
        self.start_locked(&mut state).await
    }

    async fn start_locked(self: &Arc<Self>, state: &mut ListenerState) -> Result<(), PublishError> {
        let port = state.settings.port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| PublishError::Listener { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| PublishError::Listener { port, source })?;

        let (conn_shutdown, _) = broadcast::channel(1);
        *self.conn_shutdown.lock() = Some(conn_shutdown);

        let (stop, stop_rx) = oneshot::channel::<()>();
        let app = api::router(self.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        state.running = Some(ListenerTask {
            handle,
            stop,
            local_addr,
        });
        info!(%local_addr, "listener started");
        Ok(())
    }

    async fn stop_listener(&self) {
        let mut state = self.listener.lock().await;
        Self::halt(&mut state, &self.conn_shutdown).await;
    }

    async fn halt(
        state: &mut ListenerState,
        conn_shutdown: &parking_lot::Mutex<Option<broadcast::Sender<()>>>,
    ) {
        if let Some(task) = state.running.take() {
            if let Some(tx) = conn_shutdown.lock().take() {
                let _ = tx.send(());
            }
            let _ = task.stop.send(());
            let _ = task.handle.await;
            info!("listener stopped");
        }
    }
}
