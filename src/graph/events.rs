use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attribute bag carried by nodes, edges, and mutation events.
pub type Attributes = HashMap<String, serde_json::Value>;

/// One mutation of the shared graph, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub kind: GraphEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GraphEventKind {
    AddNode {
        node: String,
        #[serde(default)]
        attributes: Attributes,
    },
    ChangeNode {
        node: String,
        attributes: Attributes,
    },
    RemoveNode {
        node: String,
    },
    AddEdge {
        edge: String,
        source: String,
        target: String,
        #[serde(default)]
        directed: bool,
        #[serde(default)]
        attributes: Attributes,
    },
    ChangeEdge {
        edge: String,
        attributes: Attributes,
    },
    RemoveEdge {
        edge: String,
    },
    Clear,
}

impl GraphEvent {
    pub fn new(actor_id: impl Into<String>, kind: GraphEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor_id: actor_id.into(),
            kind,
        }
    }
}
