//! # Graphsync - Live Graph Streaming
//!
//! Bidirectional synchronization of a mutable graph between a master process
//! hosting the authoritative copy and client processes mirroring it over
//! WebSocket streams.
//!
//! ## Features
//!
//! - **Workspace-scoped sessions**: one session model per workspace, tracking
//!   open connections and master state; exactly one model is active at a time
//! - **Master publishing**: expose a workspace's graph under a context name
//!   derived from the workspace, one publisher per context process-wide
//! - **Outbound connections**: mirror a remote context into a local graph,
//!   with per-connection traffic reports and status observers
//! - **Explicit resynchronization**: no automatic retry anywhere; a stale
//!   mirror is rebuilt by an explicit synchronize call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use graphsync::{Endpoint, ServerRegistry, ServerSettings, SessionController, Workspace};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = ServerRegistry::new(ServerSettings::default());
//!     let controller = SessionController::new(server);
//!
//!     let workspace = Workspace::new("My Graph 1");
//!     controller.initialize(&workspace);
//!
//!     // Publish this workspace's graph under /mygraph1 ...
//!     controller.start_master().await?;
//!
//!     // ... or mirror a remote master into it.
//!     let endpoint = Endpoint::parse("ws://127.0.0.1:8080/teamgraph")?;
//!     let connection = controller.connect(endpoint).await?;
//!     println!("events so far: {}", connection.report().events_received());
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod graph;
pub mod report;
pub mod server;
pub mod session;
pub mod workspace;

// Re-export main types for library consumers
pub use connection::{Connection, ConnectionStatus, Endpoint, ListenerId, StatusListener};
pub use error::{ConnectError, PublishError, StreamError};
pub use graph::{Graph, GraphEvent, GraphEventKind, GraphHandle};
pub use report::{Report, ReportSummary};
pub use server::{ClientId, ClientListener, ClientRegistry, ServerController, ServerRegistry, ServerSettings};
pub use session::{ModelSnapshot, ModelView, SessionController, SessionModel};
pub use workspace::{ServerContext, Workspace, WorkspaceId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
