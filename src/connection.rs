//! One outbound streaming connection: a WebSocket tying a remote endpoint to
//! a local graph target, with status observers and a traffic report.
//!
//! A connection runs two tasks once processing starts: a receive loop that
//! applies remote events to the target, and a forward loop that pushes
//! locally-originated target events to the remote side. Observer callbacks
//! are serialized per connection, and `on_connection_closed` is always the
//! last event delivered.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ConnectError, StreamError};
use crate::graph::{GraphEvent, GraphHandle};
use crate::report::Report;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Address of the remote side of an outbound connection. Immutable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn parse(input: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(input).map_err(|e| ConnectError::InvalidEndpoint {
            url: input.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectError::InvalidEndpoint {
                url: input.to_string(),
                reason: "scheme must be ws or wss".to_string(),
            });
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Open,
    Closed,
    Errored,
}

/// Handle returned by `add_status_listener`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer of one connection's stream activity.
///
/// Callbacks for the same connection never run concurrently with each other;
/// callbacks for different connections may.
pub trait StatusListener: Send + Sync {
    fn on_data_received(&self, connection: &Connection) {
        let _ = connection;
    }
    fn on_error(&self, connection: &Connection, error: &StreamError) {
        let _ = (connection, error);
    }
    fn on_connection_closed(&self, connection: &Connection) {
        let _ = connection;
    }
}

pub struct Connection {
    endpoint: Endpoint,
    target: GraphHandle,
    report: Arc<Report>,
    status: Mutex<ConnectionStatus>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn StatusListener>)>>,
    next_listener: AtomicU64,
    /// Serializes observer dispatch; the closed flag is checked under this
    /// lock so no data/error callback can follow `on_connection_closed`.
    dispatch: Mutex<()>,
    closed: AtomicBool,
    processing: AtomicBool,
    socket: Mutex<Option<WsStream>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Establish transport-level contact with `endpoint` and bind incoming
    /// stream events to `target`. No half-open connection is ever returned:
    /// on handshake failure the caller gets only the error.
    pub async fn open(endpoint: Endpoint, target: GraphHandle) -> Result<Arc<Self>, ConnectError> {
        let (socket, _) =
            connect_async(endpoint.as_str())
                .await
                .map_err(|source| ConnectError::Handshake {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
        debug!(endpoint = %endpoint, "connection open");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            endpoint,
            target,
            report: Arc::new(Report::new()),
            status: Mutex::new(ConnectionStatus::Open),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            dispatch: Mutex::new(()),
            closed: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            socket: Mutex::new(Some(socket)),
            shutdown,
            task: Mutex::new(None),
        }))
    }

    /// Begin consuming the stream on dedicated tasks. Non-blocking; at most
    /// one processing pair per connection, later calls are no-ops.
    pub fn process_async(self: &Arc<Self>) {
        if self.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(socket) = self.socket.lock().take() else {
            return;
        };
        let (ws_tx, ws_rx) = socket.split();
        let mut forward = tokio::spawn(forward_events(self.clone(), ws_tx));
        let mut receive = tokio::spawn(receive_events(self.clone(), ws_rx));

        let conn = self.clone();
        let supervisor = tokio::spawn(async move {
            // Either direction ending takes the whole connection down; the
            // other loop may be parked on an idle feed and has to go.
            tokio::select! {
                _ = &mut forward => {
                    receive.abort();
                    let _ = receive.await;
                }
                _ = &mut receive => {
                    forward.abort();
                    let _ = forward.await;
                }
            }
            // Remote hangup or shutdown; a fatal error already marked itself.
            conn.finish(false);
        });
        *self.task.lock() = Some(supervisor);
    }

    /// Terminate the stream and release transport resources. Observers get
    /// `on_connection_closed` exactly once in total; closing an already
    /// closed connection is a no-op.
    pub fn close(&self) {
        // Drops the socket if processing never started.
        self.socket.lock().take();
        let _ = self.shutdown.send(true);
        self.finish(false);
    }

    /// Wait for the processing tasks to wind down. No-op if processing never
    /// started.
    pub async fn finished(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn report(&self) -> &Arc<Report> {
        &self.report
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    pub fn status_listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn StatusListener>> {
        self.listeners.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    fn notify_data(&self) {
        let _guard = self.dispatch.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        for listener in self.listeners_snapshot() {
            listener.on_data_received(self);
        }
    }

    fn notify_error(&self, error: &StreamError) {
        let _guard = self.dispatch.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        for listener in self.listeners_snapshot() {
            listener.on_error(self, error);
        }
    }

    fn finish(&self, errored: bool) {
        let _guard = self.dispatch.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.status.lock() = if errored {
            ConnectionStatus::Errored
        } else {
            ConnectionStatus::Closed
        };
        let _ = self.shutdown.send(true);
        debug!(endpoint = %self.endpoint, errored, "connection closed");
        for listener in self.listeners_snapshot() {
            listener.on_connection_closed(self);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

async fn receive_events(conn: Arc<Connection>, mut ws_rx: SplitStream<WsStream>) {
    let mut shutdown = conn.shutdown.subscribe();
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    match serde_json::from_str::<GraphEvent>(&text) {
                        Ok(event) => {
                            // Echo suppression: our own events come back from
                            // the master's fan-out.
                            if event.actor_id != conn.target.actor_id() {
                                conn.target.apply(event);
                            }
                            conn.report.record_received(text.len() as u64);
                            conn.notify_data();
                        }
                        Err(e) => {
                            let error = StreamError::MalformedFrame(e.to_string());
                            conn.report.record_error(&error);
                            conn.notify_error(&error);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let error = StreamError::Transport(e.to_string());
                    conn.report.record_error(&error);
                    conn.notify_error(&error);
                    conn.finish(true);
                    break;
                }
            }
        }
    }
}

async fn forward_events(conn: Arc<Connection>, mut ws_tx: SplitSink<WsStream, Message>) {
    let mut rx = conn.target.subscribe();
    let mut shutdown = conn.shutdown.subscribe();
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            event = rx.recv() => match event {
                Ok(event) if event.actor_id == conn.target.actor_id() => {
                    let Ok(json) = serde_json::to_string(&*event) else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                    conn.report.record_sent();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, endpoint = %conn.endpoint, "local event feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
