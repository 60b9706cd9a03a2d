use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use graphsync::{
    Endpoint, GraphEventKind, ModelSnapshot, ModelView, ServerContext, ServerRegistry,
    ServerSettings, SessionController, Workspace,
};

#[derive(Parser)]
#[command(name = "graphsync")]
#[command(
    about = "Live bidirectional graph streaming: publish a workspace's graph as a master or mirror a remote context",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish the workspace graph as a master context
    Master {
        /// Workspace display name; the published context is derived from it
        #[arg(short, long, default_value = "My Graph 1")]
        name: String,

        /// Listening port
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Emit a demo event stream into the published graph
        #[arg(long)]
        demo: bool,
    },

    /// Connect to a remote master and mirror its graph
    Connect {
        /// Master endpoint, e.g. ws://localhost:8080/mygraph1
        url: String,

        /// Local workspace display name
        #[arg(short, long, default_value = "mirror")]
        name: String,
    },

    /// Show the context a workspace name publishes under
    Context { name: String },
}

struct ConsoleView;

impl ModelView for ConsoleView {
    fn refresh_model(&self, snapshot: &ModelSnapshot) {
        if snapshot.master_running {
            println!(
                "{} Master running under {} with {} client(s)",
                "→".bright_blue(),
                snapshot
                    .server_context
                    .as_deref()
                    .unwrap_or("?")
                    .bright_yellow(),
                snapshot.connected_clients.len()
            );
        }
        for connection in &snapshot.connections {
            println!(
                "{} {} [{:?}]",
                "→".bright_blue(),
                connection.endpoint.bright_yellow(),
                connection.status
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Master { name, port, demo } => run_master(name, port, demo).await,
        Commands::Connect { url, name } => run_connect(url, name).await,
        Commands::Context { name } => {
            println!("{}", ServerContext::derive(&name));
            Ok(())
        }
    }
}

async fn run_master(name: String, port: u16, demo: bool) -> Result<()> {
    let server = ServerRegistry::new(ServerSettings { port });
    let controller = SessionController::new(server);
    controller.set_view(Arc::new(ConsoleView));

    let workspace = Workspace::new(&name);
    controller.initialize(&workspace);
    controller.start_master().await?;

    let addr = controller
        .server()
        .bound_addr()
        .await
        .expect("listener is running after start_master");
    println!(
        "{} Publishing {} at {}",
        "✓".green(),
        workspace.server_context().to_string().bright_yellow(),
        format!("ws://{}{}", addr, workspace.server_context()).bright_blue()
    );

    let demo_task = demo.then(|| {
        let graph = workspace.graph().clone();
        tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                graph.emit(GraphEventKind::AddNode {
                    node: format!("n{n}"),
                    attributes: Default::default(),
                });
                if n > 0 {
                    graph.emit(GraphEventKind::AddEdge {
                        edge: format!("e{n}"),
                        source: format!("n{}", n - 1),
                        target: format!("n{n}"),
                        directed: false,
                        attributes: Default::default(),
                    });
                }
                n += 1;
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    if let Some(task) = demo_task {
        task.abort();
    }
    controller.stop_master().await;
    controller.unselect(&workspace).await;
    println!("{} Master stopped", "✓".green());
    Ok(())
}

async fn run_connect(url: String, name: String) -> Result<()> {
    let server = ServerRegistry::new(ServerSettings::default());
    let controller = SessionController::new(server);

    let workspace = Workspace::new(&name);
    controller.initialize(&workspace);

    let endpoint = Endpoint::parse(&url)?;
    let connection = controller.connect(endpoint).await?;
    println!(
        "{} Mirroring {}",
        "✓".green(),
        connection.endpoint().to_string().bright_blue()
    );

    let report = connection.report().clone();
    let graph = workspace.graph().clone();
    let progress = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            println!(
                "{} {} events, {} bytes, {} errors | graph: {} nodes, {} edges",
                "→".bright_blue(),
                report.events_received(),
                report.bytes_received(),
                report.errors(),
                graph.node_count(),
                graph.edge_count()
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    progress.abort();
    controller.unselect(&workspace).await;
    connection.finished().await;
    println!("{} Disconnected", "✓".green());
    Ok(())
}
