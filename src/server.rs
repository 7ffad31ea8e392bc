//! Server hub: listener, connection registry, broadcast fan-out
//!
//! The hub owns the accept loop and a concurrent registry of live
//! connections. Enumeration works on a snapshot, so broadcasts never hold
//! the registry lock across a send, and per-connection teardown can remove
//! entries while a fan-out is in flight. Broadcast delivery counts
//! successful enqueues; a slow peer never stalls the others.
//!
//! # Example
//!
//! ```ignore
//! use hubsock::{Config, Connection, Message, ServerHub, WebSocketHandler};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl WebSocketHandler for Echo {
//!     async fn on_text(&self, conn: &Arc<Connection>, msg: Message) {
//!         if let Ok(text) = msg.text() {
//!             conn.send_text(text).await.ok();
//!         }
//!     }
//! }
//!
//! let hub = ServerHub::new(Echo, Config::default());
//! let addr = hub.start(("0.0.0.0", 9001)).await?;
//! // ... later
//! hub.stop().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Config;
use crate::buffer::PreservedBuffer;
use crate::connection::{self, Connection, ConnectionId};
use crate::error::{CloseReason, Result};
use crate::frame::{self, OpCode};
use crate::http::HttpRequest;
use crate::protocol::Message;
use crate::SMALL_PAYLOAD_LIMIT;

/// User hooks invoked by the hub
///
/// Implement on the type that carries your application state; every method
/// has a no-op default. Hooks run on the connection's task: a slow hook
/// delays that connection's ingress only.
pub trait WebSocketHandler: Send + Sync + 'static {
    /// Accept or refuse a client after its upgrade request parsed.
    /// Returning false drops the connection without a 101.
    fn authenticate(&self, request: &HttpRequest) -> impl Future<Output = bool> + Send {
        let _ = request;
        async { true }
    }

    /// The 101 response is on the wire and the connection is registered
    fn on_handshake_complete(&self, conn: &Arc<Connection>) -> impl Future<Output = ()> + Send {
        let _ = conn;
        async {}
    }

    /// A text message (or text fragment, when reassembly is off) arrived
    fn on_text(&self, conn: &Arc<Connection>, message: Message) -> impl Future<Output = ()> + Send {
        let _ = (conn, message);
        async {}
    }

    /// A binary message (or fragment) arrived
    fn on_binary(
        &self,
        conn: &Arc<Connection>,
        message: Message,
    ) -> impl Future<Output = ()> + Send {
        let _ = (conn, message);
        async {}
    }

    /// The peer answered a ping
    fn on_pong(
        &self,
        conn: &Arc<Connection>,
        payload: PreservedBuffer,
    ) -> impl Future<Output = ()> + Send {
        let _ = (conn, payload);
        async {}
    }

    /// The connection is going away; `reason` carries the peer's close
    /// status when it sent one
    fn on_close(
        &self,
        conn: &Arc<Connection>,
        reason: Option<CloseReason>,
    ) -> impl Future<Output = ()> + Send {
        let _ = (conn, reason);
        async {}
    }
}

/// Concurrent set of live connections, keyed by identity
pub(crate) struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        self.connections.write().insert(conn.id(), conn);
    }

    pub(crate) fn remove(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
    }

    /// Copy-on-read enumeration; tolerates concurrent insert/remove
    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub(crate) fn clear(&self) {
        self.connections.write().clear();
    }
}

struct ListenerState {
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

/// WebSocket server hub
///
/// Owns the listener, the registry, and the fan-out operations. All
/// methods take `&self`; wrap the hub in an `Arc` to share it with
/// handler code.
pub struct ServerHub<H: WebSocketHandler> {
    handler: Arc<H>,
    config: Config,
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
    listener: Mutex<ListenerState>,
}

impl<H: WebSocketHandler> ServerHub<H> {
    /// Create a hub with the given handler and configuration
    pub fn new(handler: H, config: Config) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            registry: Arc::new(Registry::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            listener: Mutex::new(ListenerState {
                task: None,
                shutdown: None,
            }),
        }
    }

    /// The hub configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind a listener on the event loop and start accepting
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self, addr: impl tokio::net::ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        self.start_with_listener(listener)
    }

    /// Adopt a pre-bound blocking OS listener
    ///
    /// The second transport mode: the socket may come from inherited FDs,
    /// systemd activation, or any non-tokio setup.
    pub fn start_std(&self, listener: std::net::TcpListener) -> Result<SocketAddr> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        self.start_with_listener(listener)
    }

    fn start_with_listener(&self, listener: TcpListener) -> Result<SocketAddr> {
        let addr = listener.local_addr()?;
        let mut state = self.listener.lock();
        if state.task.is_some() {
            return Err(crate::error::Error::InvalidState("hub already started"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.handler.clone(),
            self.config.clone(),
            self.next_id.clone(),
            shutdown_rx,
        ));
        state.task = Some(task);
        state.shutdown = Some(shutdown_tx);
        info!(%addr, "hub listening");
        Ok(addr)
    }

    /// Number of registered live connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Send a text frame to every matching connection; returns the number
    /// of successful enqueues
    pub fn broadcast_text(&self, text: &str) -> usize {
        self.broadcast_text_where(text, |_| true)
    }

    /// [`broadcast_text`](Self::broadcast_text) with a predicate
    pub fn broadcast_text_where<F>(&self, text: &str, predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, OpCode::Text, text.as_bytes(), true);
        self.fan_out(buf.freeze(), predicate)
    }

    /// Send a binary frame to every matching connection; returns the
    /// number of successful enqueues
    pub fn broadcast_binary(&self, data: &[u8]) -> usize {
        self.broadcast_binary_where(data, |_| true)
    }

    /// [`broadcast_binary`](Self::broadcast_binary) with a predicate
    pub fn broadcast_binary_where<F>(&self, data: &[u8], predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, OpCode::Binary, data, true);
        self.fan_out(buf.freeze(), predicate)
    }

    /// Ping every matching connection; the payload is clamped to the
    /// control-frame limit
    pub fn ping(&self, payload: &[u8]) -> usize {
        self.ping_where(payload, |_| true)
    }

    /// [`ping`](Self::ping) with a predicate
    pub fn ping_where<F>(&self, payload: &[u8], predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let payload = &payload[..payload.len().min(SMALL_PAYLOAD_LIMIT)];
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, OpCode::Ping, payload, true);
        self.fan_out(buf.freeze(), predicate)
    }

    /// Send a close frame to every matching connection; returns the count
    /// attempted
    pub fn close_all(&self, reason: Option<CloseReason>) -> usize {
        self.close_all_where(reason, |_| true)
    }

    /// [`close_all`](Self::close_all) with a predicate
    pub fn close_all_where<F>(&self, reason: Option<CloseReason>, predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut buf = BytesMut::new();
        match &reason {
            Some(r) => frame::encode_close(&mut buf, r.code, &r.reason),
            None => frame::encode_frame(&mut buf, OpCode::Close, &[], true),
        }
        let close = buf.freeze();

        let mut attempted = 0;
        for conn in self.registry.snapshot() {
            if conn.is_closed() || !predicate(&conn) {
                continue;
            }
            attempted += 1;
            let _ = conn.try_send_frame(close.clone());
            conn.begin_shutdown();
        }
        attempted
    }

    /// Prepared-frame fan-out over a registry snapshot. Per-target failure
    /// (closed, queue full) is swallowed; the target just is not counted.
    fn fan_out<F>(&self, frame: Bytes, predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut delivered = 0;
        for conn in self.registry.snapshot() {
            if conn.is_closed() || !predicate(&conn) {
                continue;
            }
            if conn.try_send_frame(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Stop the listener and close every connection
    ///
    /// After return no new connection tasks are running. Idempotent: a
    /// second call is a no-op.
    pub async fn stop(&self) {
        let (task, shutdown) = {
            let mut state = self.listener.lock();
            (state.task.take(), state.shutdown.take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = task {
            let _ = task.await;
            info!("hub stopped");
        }

        let mut buf = BytesMut::new();
        frame::encode_close(&mut buf, CloseReason::GOING_AWAY, "");
        let close = buf.freeze();
        for conn in self.registry.snapshot() {
            let _ = conn.try_send_frame(close.clone());
            conn.begin_shutdown();
        }
        self.registry.clear();
    }
}

async fn accept_loop<H: WebSocketHandler>(
    listener: TcpListener,
    registry: Arc<Registry>,
    handler: Arc<H>,
    config: Config,
    next_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(connection = id, %peer, "accepted");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(connection::serve_connection(
                        stream,
                        id,
                        registry.clone(),
                        handler.clone(),
                        config.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
        }
    }
}
