use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graphsync::{
    ClientId, Connection, ConnectionStatus, Endpoint, GraphEventKind, GraphHandle, PublishError,
    ServerContext, ServerController, ServerRegistry, ServerSettings, SessionController,
    StatusListener, Workspace,
};
use tokio::time::sleep;

/// Spin up a controller publishing `name` on an ephemeral port and return the
/// endpoint url clients can reach it at.
async fn start_master(name: &str) -> (SessionController, Workspace, String) {
    let server = ServerRegistry::new(ServerSettings { port: 0 });
    let controller = SessionController::new(server);
    let workspace = Workspace::new(name);
    controller.initialize(&workspace);
    controller.start_master().await.expect("start master");
    let addr = controller
        .server()
        .bound_addr()
        .await
        .expect("listener running");
    let url = format!("ws://127.0.0.1:{}{}", addr.port(), workspace.server_context());
    (controller, workspace, url)
}

fn mirror_controller() -> SessionController {
    SessionController::new(ServerRegistry::new(ServerSettings { port: 0 }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connected_clients_empty_after_stop_master() {
    let server = ServerRegistry::new(ServerSettings { port: 0 });
    let controller = SessionController::new(server);
    let workspace = Workspace::new("stop master clears");
    controller.initialize(&workspace);
    controller.start_master().await.unwrap();
    let model = controller.streaming_model().unwrap();

    // Churn membership from another task while the master stops.
    let churn_model = model.clone();
    let churn = tokio::spawn(async move {
        for i in 0..200 {
            let id = ClientId::new();
            churn_model.add_connected(&id);
            if i % 3 == 0 {
                churn_model.remove_connected(&id);
            }
            tokio::task::yield_now().await;
        }
    });

    sleep(Duration::from_millis(5)).await;
    controller.stop_master().await;
    churn.await.unwrap();

    assert!(!model.master_running());
    assert!(
        model.connected_clients().is_empty(),
        "late client events must not survive stop_master"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_conflict_keeps_first_mapping() {
    let server = ServerRegistry::new(ServerSettings { port: 0 });
    let graph_a = GraphHandle::new("actor-a");
    let graph_b = GraphHandle::new("actor-b");
    graph_a.emit(GraphEventKind::AddNode {
        node: "from-a".into(),
        attributes: Default::default(),
    });

    let context = ServerContext::derive("Shared Graph");
    let first = Arc::new(ServerController::new(graph_a));
    let second = Arc::new(ServerController::new(graph_b));

    server.publish(context.clone(), first).await.unwrap();
    let err = server.publish(context.clone(), second).await.unwrap_err();
    assert!(matches!(err, PublishError::ContextConflict(_)));
    assert!(server.is_published(&context));

    // The context still serves A's graph: a fresh mirror sees A's node.
    let addr = server.bound_addr().await.unwrap();
    let mirror = GraphHandle::new("mirror");
    let connection = Connection::open(
        Endpoint::parse(&format!("ws://127.0.0.1:{}{}", addr.port(), context)).unwrap(),
        mirror.clone(),
    )
    .await
    .unwrap();
    connection.process_async();

    let start = std::time::Instant::now();
    while mirror.with_graph(|g| g.node("from-a").is_none()) {
        assert!(start.elapsed() < Duration::from_secs(3), "snapshot not received");
        sleep(Duration::from_millis(20)).await;
    }

    connection.close();
    connection.finished().await;
    server.unpublish(&context).await;
}

struct ClosedCounter {
    closed: AtomicUsize,
}

impl StatusListener for ClosedCounter {
    fn on_connection_closed(&self, _connection: &Connection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_close_notifies_once() {
    let (_hub, _hub_ws, url) = start_master("double close hub").await;

    let client = mirror_controller();
    let workspace = Workspace::new("double close mirror");
    client.initialize(&workspace);
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();

    let first = Arc::new(ClosedCounter {
        closed: AtomicUsize::new(0),
    });
    let second = Arc::new(ClosedCounter {
        closed: AtomicUsize::new(0),
    });
    connection.add_status_listener(first.clone());
    connection.add_status_listener(second.clone());

    connection.close();
    connection.close();
    connection.finished().await;
    // The processing tasks observed the shutdown too; no second delivery.
    sleep(Duration::from_millis(100)).await;

    assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    assert_eq!(second.closed.load(Ordering::SeqCst), 1);
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_synchronize_leaves_degraded_consistent_state() {
    let (hub, hub_ws, url) = start_master("sync fail hub").await;
    hub_ws.graph().emit(GraphEventKind::AddNode {
        node: "seed".into(),
        attributes: Default::default(),
    });

    let client = mirror_controller();
    let workspace = Workspace::new("sync fail mirror");
    client.initialize(&workspace);
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();

    let start = std::time::Instant::now();
    while workspace.graph().node_count() == 0 {
        assert!(start.elapsed() < Duration::from_secs(3), "mirror never filled");
        sleep(Duration::from_millis(20)).await;
    }

    // Take the master away so the reopen inside synchronize must fail.
    hub.stop_master().await;
    let start = std::time::Instant::now();
    while !connection.is_closed() {
        assert!(start.elapsed() < Duration::from_secs(3), "remote drop not observed");
        sleep(Duration::from_millis(20)).await;
    }
    connection.finished().await;

    let err = client.synchronize(&connection).await;
    assert!(err.is_err());

    let model = client.streaming_model().unwrap();
    assert_eq!(model.connection_count(), 0, "old connection must be gone");
    assert_eq!(workspace.graph().node_count(), 0, "target stays cleared");
    assert!(connection.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unselect_tears_down_master_and_connections() {
    let (_hub, _hub_ws, url) = start_master("teardown hub").await;

    let controller = mirror_controller();
    let workspace = Workspace::new("Busy Workspace");
    controller.initialize(&workspace);
    controller.start_master().await.unwrap();

    let endpoint = Endpoint::parse(&url).unwrap();
    let first = controller.connect(endpoint.clone()).await.unwrap();
    let second = controller.connect(endpoint).await.unwrap();

    let model = controller.streaming_model().unwrap();
    let context = workspace.server_context();
    assert!(model.master_running());
    assert_eq!(model.connection_count(), 2);

    controller.unselect(&workspace).await;

    assert!(!model.master_running());
    assert!(model.connected_clients().is_empty());
    assert!(!controller.server().is_published(&context));
    assert_eq!(model.connection_count(), 0);
    assert!(first.is_closed());
    assert!(second.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn colliding_workspace_names_conflict() {
    let server = ServerRegistry::new(ServerSettings { port: 0 });
    let controller = SessionController::new(server);

    let first_ws = Workspace::new("Team Graph");
    controller.initialize(&first_ws);
    controller.start_master().await.unwrap();

    // The host switches workspaces without tearing the first down; the
    // second derives the same context and must be rejected.
    let second_ws = Workspace::new("team graph");
    assert_eq!(first_ws.server_context(), second_ws.server_context());
    controller.select(&second_ws);

    let err = controller.start_master().await.unwrap_err();
    assert!(matches!(err, PublishError::ContextConflict(_)));
    assert!(!controller.streaming_model().unwrap().master_running());
    assert!(controller.server().is_published(&first_ws.server_context()));

    // First workspace's session is untouched.
    controller.select(&first_ws);
    assert!(controller.streaming_model().unwrap().master_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_then_close_releases_everything() {
    let (hub, _hub_ws, url) = start_master("cleanup hub").await;

    let client = mirror_controller();
    let workspace = Workspace::new("cleanup mirror");
    client.initialize(&workspace);
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        hub.streaming_model().unwrap().connected_clients().len(),
        1,
        "master should have seen the client arrive"
    );

    let counter = Arc::new(ClosedCounter {
        closed: AtomicUsize::new(0),
    });
    let listener = connection.add_status_listener(counter.clone());

    connection.close();
    connection.finished().await;
    connection.remove_status_listener(listener);
    assert_eq!(connection.status_listener_count(), 0);

    client.unselect(&workspace).await;
    // Test-local handle is the only one left once model and tasks let go.
    assert_eq!(Arc::strong_count(&connection), 1);

    let start = std::time::Instant::now();
    while !hub.streaming_model().unwrap().connected_clients().is_empty() {
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "master never saw the client leave"
        );
        sleep(Duration::from_millis(20)).await;
    }
}
