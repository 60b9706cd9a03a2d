//! WebSocket accept path for published contexts.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::clients::ClientId;
use super::{ServerController, ServerRegistry};
use crate::graph::GraphEvent;

pub(crate) fn router(registry: Arc<ServerRegistry>) -> Router {
    Router::new()
        .route("/{*context}", get(ws_handler))
        .with_state(registry)
}

async fn ws_handler(
    State(registry): State<Arc<ServerRegistry>>,
    Path(context): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let path = format!("/{context}");
    let Some((controller, ctx_shutdown)) = registry.lookup(&path) else {
        debug!(%path, "rejecting connection for unpublished context");
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(listener_shutdown) = registry.conn_shutdown_rx() else {
        // The listener is mid-teardown; nothing to serve.
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, controller, ctx_shutdown, listener_shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    controller: Arc<ServerController>,
    ctx_shutdown: broadcast::Receiver<()>,
    listener_shutdown: broadcast::Receiver<()>,
) {
    let client_id = ClientId::new();
    controller.clients().client_connected(&client_id);

    let (sender, receiver) = socket.split();
    let mut send_task = tokio::spawn(fan_out(
        controller.clone(),
        sender,
        ctx_shutdown.resubscribe(),
        listener_shutdown.resubscribe(),
    ));
    let mut recv_task = tokio::spawn(pump_in(
        controller.clone(),
        receiver,
        ctx_shutdown,
        listener_shutdown,
    ));
    // A dead client ends the receive side first while fan-out sits on an
    // idle feed; whichever direction ends tears down the other.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }

    controller.clients().client_disconnected(&client_id);
}

/// Master-to-client direction: replay the current graph, then forward the
/// live event feed. Every event is forwarded; clients drop their own echoes
/// by actor id.
async fn fan_out(
    controller: Arc<ServerController>,
    mut sender: SplitSink<WebSocket, Message>,
    mut ctx_shutdown: broadcast::Receiver<()>,
    mut listener_shutdown: broadcast::Receiver<()>,
) {
    // Subscribe before the snapshot so nothing falls between replay and the
    // live feed.
    let mut rx = controller.graph().subscribe();
    for event in controller.graph().snapshot_events() {
        let Ok(json) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = ctx_shutdown.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            _ = listener_shutdown.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&*event) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client fan-out lagged behind the event feed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Client-to-master direction: apply inbound events to the published graph,
/// which republishes them to every consumer.
async fn pump_in(
    controller: Arc<ServerController>,
    mut receiver: SplitStream<WebSocket>,
    mut ctx_shutdown: broadcast::Receiver<()>,
    mut listener_shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = ctx_shutdown.recv() => break,
            _ = listener_shutdown.recv() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    match serde_json::from_str::<GraphEvent>(&text) {
                        Ok(event) => {
                            if event.actor_id != controller.graph().actor_id() {
                                controller.graph().apply(event);
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "dropping malformed frame from client");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "client socket error");
                    break;
                }
            }
        }
    }
}
