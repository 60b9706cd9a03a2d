use std::time::Duration;

use graphsync::{
    Endpoint, GraphEventKind, ServerRegistry, ServerSettings, SessionController, Workspace,
};
use tokio::time::sleep;

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

fn mirror(name: &str) -> (SessionController, Workspace) {
    let controller = SessionController::new(ServerRegistry::new(ServerSettings { port: 0 }));
    let workspace = Workspace::new(name);
    controller.initialize(&workspace);
    (controller, workspace)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !check() {
        assert!(start.elapsed() < Duration::from_secs(3), "timed out: {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn master_graph_mirrors_to_client() {
    let (_hub, hub_ws, url) = start_master("mirror hub").await;

    // State present before the client arrives comes through the snapshot.
    hub_ws.graph().emit(GraphEventKind::AddEdge {
        edge: "e1".into(),
        source: "a".into(),
        target: "b".into(),
        directed: false,
        attributes: Default::default(),
    });

    let (client, client_ws) = mirror("mirror client");
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();

    let graph = client_ws.graph().clone();
    wait_until("snapshot replay", || graph.edge_count() == 1).await;
    assert_eq!(graph.node_count(), 2);

    // Mutations after the snapshot arrive live.
    hub_ws.graph().emit(GraphEventKind::AddNode {
        node: "late".into(),
        attributes: Default::default(),
    });
    wait_until("live event", || graph.with_graph(|g| g.node("late").is_some())).await;

    assert!(connection.report().events_received() >= 3);
    assert_eq!(connection.report().errors(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_events_reach_master_and_other_clients() {
    let (_hub, hub_ws, url) = start_master("echo hub").await;
    let endpoint = Endpoint::parse(&url).unwrap();

    let (client_a, ws_a) = mirror("echo client a");
    let _conn_a = client_a.connect(endpoint.clone()).await.unwrap();
    let (client_b, ws_b) = mirror("echo client b");
    let _conn_b = client_b.connect(endpoint).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // A locally-originated event on A's workspace graph flows upstream.
    ws_a.graph().emit(GraphEventKind::AddNode {
        node: "from-a".into(),
        attributes: Default::default(),
    });

    let hub_graph = hub_ws.graph().clone();
    wait_until("master applied client event", || {
        hub_graph.with_graph(|g| g.node("from-a").is_some())
    })
    .await;

    // ... and fans out to the other client.
    let graph_b = ws_b.graph().clone();
    wait_until("fan-out to second client", || {
        graph_b.with_graph(|g| g.node("from-a").is_some())
    })
    .await;

    // The originator does not re-apply its own echo: one node, not a dupe.
    assert_eq!(ws_a.graph().node_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn master_model_tracks_client_membership() {
    let (hub, _hub_ws, url) = start_master("membership hub").await;
    let model = hub.streaming_model().unwrap();

    let (client, client_ws) = mirror("membership client");
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();

    wait_until("client arrival", || model.connected_clients().len() == 1).await;

    connection.close();
    connection.finished().await;
    wait_until("client departure", || model.connected_clients().is_empty()).await;

    client.unselect(&client_ws).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_restart_drops_clients_but_keeps_context() {
    let (hub, hub_ws, url) = start_master("restart hub").await;
    let context = hub_ws.server_context();

    let (client, _client_ws) = mirror("restart client");
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    hub.apply_settings(ServerSettings { port: 0 }).await.unwrap();

    // The listener bounce drops every connected client ...
    wait_until("client dropped by restart", || connection.is_closed()).await;

    // ... but the published context survives and serves on the new port.
    assert!(hub.server().is_published(&context));
    assert!(hub.streaming_model().unwrap().master_running());
    let new_addr = hub.server().bound_addr().await.expect("listener restarted");
    let new_url = format!("ws://127.0.0.1:{}{}", new_addr.port(), context);
    let reconnection = client.connect(Endpoint::parse(&new_url).unwrap()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(!reconnection.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unpublish_drops_connected_clients() {
    let (hub, _hub_ws, url) = start_master("drop hub").await;

    let (client, _client_ws) = mirror("dropped client");
    let connection = client.connect(Endpoint::parse(&url).unwrap()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    hub.stop_master().await;

    // The remote end is dropped abruptly; the connection winds down on its
    // own without a local close call.
    wait_until("client connection closed", || connection.is_closed()).await;
    assert!(hub.streaming_model().unwrap().connected_clients().is_empty());
}
