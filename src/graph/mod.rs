//! The graph collaborator at its interface boundary: an in-memory node/edge
//! store and a shared handle that applies mutation events in place and fans
//! them out to subscribers over a broadcast channel.

pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

pub use events::{Attributes, GraphEvent, GraphEventKind};

/// Broadcast capacity for the live event feed. Slow subscribers lag rather
/// than block the writer.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub directed: bool,
    pub attributes: Attributes,
}

/// In-memory mixed graph keyed by node/edge id.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
}

impl Graph {
    /// Apply one mutation in place. Tolerant of stream ordering: adding an
    /// edge whose endpoints have not arrived yet creates them implicitly, and
    /// changes to unknown elements are dropped.
    pub fn apply(&mut self, kind: &GraphEventKind) {
        match kind {
            GraphEventKind::AddNode { node, attributes } => {
                let entry = self.nodes.entry(node.clone()).or_insert_with(|| Node {
                    id: node.clone(),
                    attributes: Attributes::new(),
                });
                entry.attributes.extend(attributes.clone());
            }
            GraphEventKind::ChangeNode { node, attributes } => {
                if let Some(existing) = self.nodes.get_mut(node) {
                    existing.attributes.extend(attributes.clone());
                }
            }
            GraphEventKind::RemoveNode { node } => {
                self.nodes.remove(node);
                self.edges
                    .retain(|_, e| e.source != *node && e.target != *node);
            }
            GraphEventKind::AddEdge {
                edge,
                source,
                target,
                directed,
                attributes,
            } => {
                for endpoint in [source, target] {
                    self.nodes.entry(endpoint.clone()).or_insert_with(|| Node {
                        id: endpoint.clone(),
                        attributes: Attributes::new(),
                    });
                }
                let entry = self.edges.entry(edge.clone()).or_insert_with(|| Edge {
                    id: edge.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    directed: *directed,
                    attributes: Attributes::new(),
                });
                entry.attributes.extend(attributes.clone());
            }
            GraphEventKind::ChangeEdge { edge, attributes } => {
                if let Some(existing) = self.edges.get_mut(edge) {
                    existing.attributes.extend(attributes.clone());
                }
            }
            GraphEventKind::RemoveEdge { edge } => {
                self.edges.remove(edge);
            }
            GraphEventKind::Clear => {
                self.nodes.clear();
                self.edges.clear();
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }
}

/// Shared handle over one workspace's graph.
///
/// Cloning shares state. Every applied event is also published on the live
/// feed; subscribers decide by `actor_id` whether an event is locally
/// originated (to be forwarded upstream) or a remote echo.
#[derive(Clone)]
pub struct GraphHandle {
    actor_id: Arc<str>,
    graph: Arc<RwLock<Graph>>,
    events: broadcast::Sender<Arc<GraphEvent>>,
}

impl GraphHandle {
    pub fn new(actor_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            actor_id: actor_id.into().into(),
            graph: Arc::new(RwLock::new(Graph::default())),
            events,
        }
    }

    /// Actor id stamped on locally-originated events.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Create, apply, and publish a locally-originated event.
    pub fn emit(&self, kind: GraphEventKind) -> Arc<GraphEvent> {
        self.apply(GraphEvent::new(self.actor_id.as_ref(), kind))
    }

    /// Apply an event (local or remote) and publish it on the live feed.
    pub fn apply(&self, event: GraphEvent) -> Arc<GraphEvent> {
        self.graph.write().apply(&event.kind);
        let event = Arc::new(event);
        // Send only fails with no live subscribers, which is fine.
        let _ = self.events.send(event.clone());
        event
    }

    /// Reset the graph without emitting an event. Used when a target is
    /// cleared ahead of resynchronization; the reset is a local affair and
    /// must not propagate to the remote side.
    pub fn clear(&self) {
        self.graph.write().apply(&GraphEventKind::Clear);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GraphEvent>> {
        self.events.subscribe()
    }

    pub fn node_count(&self) -> usize {
        self.graph.read().node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.read().edge_count()
    }

    /// Read access to the underlying graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        f(&self.graph.read())
    }

    /// Replay the current graph as a sequence of add events, stamped with
    /// this handle's actor id. A newly accepted client receives this burst
    /// before live fan-out begins.
    pub fn snapshot_events(&self) -> Vec<GraphEvent> {
        let graph = self.graph.read();
        let mut events = Vec::with_capacity(graph.nodes.len() + graph.edges.len());
        for node in graph.nodes.values() {
            events.push(GraphEvent::new(
                self.actor_id.as_ref(),
                GraphEventKind::AddNode {
                    node: node.id.clone(),
                    attributes: node.attributes.clone(),
                },
            ));
        }
        for edge in graph.edges.values() {
            events.push(GraphEvent::new(
                self.actor_id.as_ref(),
                GraphEventKind::AddEdge {
                    edge: edge.id.clone(),
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    directed: edge.directed,
                    attributes: edge.attributes.clone(),
                },
            ));
        }
        events
    }
}

impl std::fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph.read();
        f.debug_struct("GraphHandle")
            .field("actor_id", &self.actor_id)
            .field("nodes", &graph.node_count())
            .field("edges", &graph.edge_count())
            .finish()
    }
}
