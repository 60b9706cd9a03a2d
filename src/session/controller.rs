//! The session controller: the single component allowed to mutate session
//! models and drive the server registry and transport, making it the
//! linearization point for all session state changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::connection::{Connection, Endpoint};
use crate::error::{ConnectError, PublishError};
use crate::server::{ClientId, ClientListener, ServerController, ServerRegistry, ServerSettings};
use crate::session::model::{ModelSnapshot, SessionModel};
use crate::workspace::{Workspace, WorkspaceId};

/// Presentation-side observer receiving model snapshots on every state
/// change.
pub trait ModelView: Send + Sync {
    fn refresh_model(&self, snapshot: &ModelSnapshot);
}

struct ActiveSession {
    workspace: Workspace,
    model: Arc<SessionModel>,
}

/// Forwards client registry events of the published context into the owning
/// model. The model itself drops events once the master stopped.
struct ModelClientListener {
    model: Arc<SessionModel>,
}

impl ClientListener for ModelClientListener {
    fn client_connected(&self, id: &ClientId) {
        self.model.add_connected(id);
    }

    fn client_disconnected(&self, id: &ClientId) {
        self.model.remove_connected(id);
    }
}

pub struct SessionController {
    server: Arc<ServerRegistry>,
    models: Mutex<HashMap<WorkspaceId, Arc<SessionModel>>>,
    active: Mutex<Option<ActiveSession>>,
    view: Mutex<Option<Arc<dyn ModelView>>>,
}

impl SessionController {
    pub fn new(server: Arc<ServerRegistry>) -> Self {
        Self {
            server,
            models: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            view: Mutex::new(None),
        }
    }

    pub fn set_view(&self, view: Arc<dyn ModelView>) {
        *self.view.lock() = Some(view);
        self.refresh();
    }

    /// The active workspace's session model, if any workspace is bound.
    pub fn streaming_model(&self) -> Option<Arc<SessionModel>> {
        self.active.lock().as_ref().map(|a| a.model.clone())
    }

    pub fn active_workspace(&self) -> Option<Workspace> {
        self.active.lock().as_ref().map(|a| a.workspace.clone())
    }

    pub fn refresh(&self) {
        let view = self.view.lock().clone();
        let model = self.streaming_model();
        if let (Some(view), Some(model)) = (view, model) {
            view.refresh_model(&model.snapshot());
        }
    }

    // ---- workspace lifecycle -------------------------------------------

    /// A workspace came into existence: attach a fresh, empty model.
    pub fn initialize(&self, workspace: &Workspace) {
        let model = Arc::new(SessionModel::new());
        self.models.lock().insert(workspace.id(), model.clone());
        *self.active.lock() = Some(ActiveSession {
            workspace: workspace.clone(),
            model,
        });
        self.refresh();
    }

    /// A workspace became current: bind its model, creating one on first
    /// selection.
    pub fn select(&self, workspace: &Workspace) {
        let model = self
            .models
            .lock()
            .entry(workspace.id())
            .or_insert_with(|| Arc::new(SessionModel::new()))
            .clone();
        *self.active.lock() = Some(ActiveSession {
            workspace: workspace.clone(),
            model,
        });
        self.refresh();
    }

    /// A workspace is being deactivated: stop its master if running and
    /// close every outbound connection it holds.
    pub async fn unselect(&self, workspace: &Workspace) {
        let model = self.models.lock().get(&workspace.id()).cloned();
        if let Some(model) = model {
            if model.master_running() {
                self.stop_master_on(&model).await;
            }
            model.remove_all_connections();
            self.refresh();
        }
    }

    /// A workspace is gone for good: discard its model. Teardown of live
    /// resources already happened in `unselect`.
    pub fn close(&self, workspace: &Workspace) {
        self.models.lock().remove(&workspace.id());
    }

    /// The host is tearing down all workspaces; drop the active binding
    /// without side effects.
    pub fn disable(&self) {
        *self.active.lock() = None;
    }

    // ---- outbound connections ------------------------------------------

    /// Open a connection to `endpoint`, mirror its stream into the active
    /// workspace's graph, and register it in the model. On failure the error
    /// is surfaced to the caller and the model is untouched.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<Arc<Connection>, ConnectError> {
        let (graph, model) = {
            let active = self.active.lock();
            let Some(active) = active.as_ref() else {
                return Err(ConnectError::NoWorkspace);
            };
            (active.workspace.graph().clone(), active.model.clone())
        };

        let connection = Connection::open(endpoint, graph).await?;
        connection.process_async();
        model.add_connection(connection.clone());
        self.refresh();
        info!(endpoint = %connection.endpoint(), "connected to stream");
        Ok(connection)
    }

    /// Resynchronize with the remote side of `connection`: close it, clear
    /// the target graph, and reconnect to the same endpoint from scratch.
    ///
    /// If the reopen fails the model is left with the old connection removed
    /// and the target cleared; a degraded but consistent state that is not
    /// retried here.
    pub async fn synchronize(
        &self,
        connection: &Arc<Connection>,
    ) -> Result<Arc<Connection>, ConnectError> {
        let (graph, model) = {
            let active = self.active.lock();
            let Some(active) = active.as_ref() else {
                return Err(ConnectError::NoWorkspace);
            };
            (active.workspace.graph().clone(), active.model.clone())
        };

        model.remove_connection(connection);
        connection.close();
        graph.clear();

        let endpoint = connection.endpoint().clone();
        match Connection::open(endpoint, graph).await {
            Ok(fresh) => {
                fresh.process_async();
                model.add_connection(fresh.clone());
                self.refresh();
                info!(endpoint = %fresh.endpoint(), "resynchronized");
                Ok(fresh)
            }
            Err(e) => {
                warn!(endpoint = %connection.endpoint(), error = %e, "resynchronization failed");
                self.refresh();
                Err(e)
            }
        }
    }

    // ---- master publishing ---------------------------------------------

    /// Publish the active workspace's graph under the context derived from
    /// its name. On `ContextConflict` nothing in the model changes.
    pub async fn start_master(&self) -> Result<(), PublishError> {
        let (workspace, model) = {
            let active = self.active.lock();
            let Some(active) = active.as_ref() else {
                return Err(PublishError::NoWorkspace);
            };
            (active.workspace.clone(), active.model.clone())
        };

        let context = workspace.server_context();
        let controller = Arc::new(ServerController::new(workspace.graph().clone()));
        self.server.publish(context.clone(), controller.clone()).await?;

        model.set_master(Some(context.clone()));
        controller
            .clients()
            .add_listener(Arc::new(ModelClientListener {
                model: model.clone(),
            }));
        // Clients accepted between publish and the listener registration
        // only show up in current membership; fold them in.
        for id in controller.clients().clients() {
            model.add_connected(&id);
        }
        self.refresh();
        info!(context = %context, "master started");
        Ok(())
    }

    /// Stop publishing the active workspace's context.
    pub async fn stop_master(&self) {
        let model = self.streaming_model();
        if let Some(model) = model {
            self.stop_master_on(&model).await;
            self.refresh();
        }
    }

    async fn stop_master_on(&self, model: &Arc<SessionModel>) {
        let Some(context) = model.server_context() else {
            return;
        };
        // Running flag drops first so registry callbacks racing the
        // unpublish are ignored by the model.
        model.set_master(None);
        self.server.unpublish(&context).await;
        info!(context = %context, "master stopped");
    }

    // ---- settings -------------------------------------------------------

    /// Change listener settings; restarts the listener if it is running.
    /// Active models are not informed of the reachability gap.
    pub async fn apply_settings(&self, settings: ServerSettings) -> Result<(), PublishError> {
        self.server.apply_settings(settings).await
    }

    pub fn server(&self) -> &Arc<ServerRegistry> {
        &self.server
    }
}
