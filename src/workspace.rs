//! Workspace identity and the published-context naming rule.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::GraphHandle;

/// Opaque workspace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(Uuid);

impl WorkspaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The name a master's stream is published under.
///
/// Derived from the workspace display name; two workspaces whose names differ
/// only in case or whitespace collide on the same context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerContext(String);

impl ServerContext {
    /// Derive a context from a workspace display name: delete all whitespace,
    /// lowercase, prefix `/`. "My Graph 1" becomes `/mygraph1`. The rule must
    /// stay byte-exact for interop with existing master/client pairings.
    pub fn derive(name: &str) -> Self {
        let token: String = name
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        Self(format!("/{token}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of streaming activity: a display name plus the graph it owns.
///
/// Cloning shares the underlying graph; workspace lifecycle itself (who
/// creates, selects, and closes workspaces) belongs to the host application.
#[derive(Clone)]
pub struct Workspace {
    id: WorkspaceId,
    name: String,
    graph: GraphHandle,
}

impl Workspace {
    pub fn new(name: impl Into<String>) -> Self {
        let id = WorkspaceId::new();
        Self {
            id,
            name: name.into(),
            graph: GraphHandle::new(format!("ws-{id}")),
        }
    }

    pub fn id(&self) -> WorkspaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &GraphHandle {
        &self.graph
    }

    /// The context this workspace would publish under.
    pub fn server_context(&self) -> ServerContext {
        ServerContext::derive(&self.name)
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
