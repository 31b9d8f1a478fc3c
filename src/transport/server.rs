//! # Server
//!
//! Accepts many incoming connections and exposes them through one shared
//! inbox.
//!
//! Every accepted socket gets the next connection id, a send task and a
//! receive task. Events from all connections land in a single [`Inbox`];
//! [`Server::tick`] drains it on the caller's thread and reports which
//! connection each event belongs to.
//!
//! ```rust,no_run
//! use std::sync::{Arc, Weak};
//! use msgpipe::config::ServerConfig;
//! use msgpipe::transport::server::Server;
//!
//! let server = Arc::new(Server::new(ServerConfig::default()).unwrap());
//! let weak: Weak<Server> = Arc::downgrade(&server);
//! server.on_data(move |id, bytes| {
//!     if let Some(server) = weak.upgrade() {
//!         server.send(id, bytes);
//!     }
//! });
//! server.start(7777);
//!
//! loop {
//!     server.tick(1000, None);
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::message::{ConnectionId, EventKind};
use crate::error::{constants, ProtocolError, Result};
use crate::pipe::Inbox;
use crate::transport::connection::ConnectionState;
use crate::transport::loops::{configure_socket, receive_loop, send_loop};
use crate::transport::runtime::TransportRuntime;
use crate::utils::metrics::{Metrics, Timer};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

type ConnectedFn = Box<dyn FnMut(ConnectionId) + Send>;
type DataFn = Box<dyn FnMut(ConnectionId, &[u8]) + Send>;
type DisconnectedFn = Box<dyn FnMut(ConnectionId) + Send>;

struct ServerCallbacks {
    on_connected: ConnectedFn,
    on_data: DataFn,
    on_disconnected: DisconnectedFn,
}

impl Default for ServerCallbacks {
    fn default() -> Self {
        Self {
            on_connected: Box::new(|_| {}),
            on_data: Box::new(|_, _| {}),
            on_disconnected: Box::new(|_| {}),
        }
    }
}

/// State reachable from the listener and connection tasks
struct ServerShared {
    config: ServerConfig,
    inbox: Inbox,
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionState>>>,
    // wider than ConnectionId so the last id can be handed out too
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ServerShared {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionState>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections().get(&id).cloned()
    }

    /// Hand out the next id; ids are never reused for the server's lifetime
    fn next_connection_id(&self) -> Result<ConnectionId> {
        let id = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                (id <= u64::from(ConnectionId::MAX)).then_some(id + 1)
            })
            .map_err(|_| ProtocolError::ConnectionIdExhausted)?;
        ConnectionId::try_from(id).map_err(|_| ProtocolError::ConnectionIdExhausted)
    }

    /// Track a newly accepted connection unless the run it belongs to was
    /// stopped
    ///
    /// The check and the insert happen under the table lock, which
    /// [`Server::stop`] also holds while cancelling the run, so a connection
    /// is either seen and closed by `stop` or never tracked at all.
    fn register(&self, run: &CancellationToken, conn: &Arc<ConnectionState>) -> bool {
        let mut connections = self.connections();
        if run.is_cancelled() {
            return false;
        }
        connections.insert(conn.id, Arc::clone(conn));
        true
    }
}

/// The accept task of one `start`/`stop` cycle
struct ListenerTask {
    handle: JoinHandle<()>,
    run: CancellationToken,
}

impl ListenerTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Multi-connection message server
pub struct Server {
    runtime: TransportRuntime,
    shared: Arc<ServerShared>,
    listener: Mutex<Option<ListenerTask>>,
    local_addr: Mutex<Option<SocketAddr>>,
    callbacks: Mutex<ServerCallbacks>,
}

impl Server {
    /// Create a server with its own background runtime
    ///
    /// Fails with `ConfigError` if `config` does not validate.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate_strict()?;
        let runtime = TransportRuntime::dedicated("msgpipe-server", None)?;
        Ok(Self::build(config, runtime))
    }

    /// Create a server whose tasks run on an existing runtime
    pub fn with_runtime(config: ServerConfig, handle: Handle) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self::build(config, TransportRuntime::shared(handle)))
    }

    fn build(config: ServerConfig, runtime: TransportRuntime) -> Self {
        let shared = ServerShared {
            inbox: Inbox::new(config.transport.max_message_size),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(u64::from(config.first_connection_id)),
            metrics: Arc::new(Metrics::new()),
            config,
        };
        Self {
            runtime,
            shared: Arc::new(shared),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            callbacks: Mutex::new(ServerCallbacks::default()),
        }
    }

    /// Called once per accepted connection
    ///
    /// The callback setters must not be called from inside a callback: the
    /// callbacks are locked for the whole of [`Server::tick`], so doing so
    /// deadlocks.
    pub fn on_connected<F: FnMut(ConnectionId) + Send + 'static>(&self, f: F) {
        self.lock_callbacks().on_connected = Box::new(f);
    }

    /// Called for every received message
    pub fn on_data<F: FnMut(ConnectionId, &[u8]) + Send + 'static>(&self, f: F) {
        self.lock_callbacks().on_data = Box::new(f);
    }

    /// Called once per connection after its last message
    pub fn on_disconnected<F: FnMut(ConnectionId) + Send + 'static>(&self, f: F) {
        self.lock_callbacks().on_disconnected = Box::new(f);
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, ServerCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<ListenerTask>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Whether the listener is running
    ///
    /// Turns `false` on its own once every connection id has been handed
    /// out: the listener logs `ConnectionIdExhausted` at `error!` and stops
    /// accepting, while existing connections keep working.
    pub fn active(&self) -> bool {
        self.lock_listener()
            .as_ref()
            .map(ListenerTask::is_running)
            .unwrap_or(false)
    }

    /// Address the listener is bound to, useful after starting on port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    /// Messages waiting to be written to one connection
    pub fn send_pipe_count(&self, id: ConnectionId) -> usize {
        self.shared
            .connection(id)
            .map(|c| c.send_pipe.count())
            .unwrap_or(0)
    }

    /// Events waiting to be drained by [`Server::tick`]
    pub fn receive_pipe_count(&self) -> usize {
        self.shared.inbox.count()
    }

    /// Bind `port` and start accepting connections
    ///
    /// Returns `false` if the server is already active or the port cannot be
    /// bound. Port 0 picks an ephemeral port, see [`Server::local_addr`].
    pub fn start(&self, port: u16) -> bool {
        let mut listener_slot = self.lock_listener();
        if listener_slot
            .as_ref()
            .map(ListenerTask::is_running)
            .unwrap_or(false)
        {
            warn!(port, "{}", constants::ERR_SERVER_ACTIVE);
            return false;
        }

        // undelivered events from a previous run are stale
        self.shared.inbox.clear();

        let listener = match self.bind(port) {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "Failed to start server");
                return false;
            }
        };
        let local = listener.local_addr().ok();
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = local;

        info!(address = ?local, "Server listening");
        let run = CancellationToken::new();
        let handle = self.runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            run.clone(),
        ));
        *listener_slot = Some(ListenerTask { handle, run });
        true
    }

    fn bind(&self, port: u16) -> Result<TcpListener> {
        let ip: IpAddr = self
            .shared
            .config
            .bind_address
            .parse()
            .map_err(|_| ProtocolError::AddressResolution(self.shared.config.bind_address.clone()))?;

        let std_listener = std::net::TcpListener::bind(SocketAddr::new(ip, port))?;
        std_listener.set_nonblocking(true)?;

        let _guard = self.runtime.handle().enter();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Stop accepting and close every connection
    ///
    /// The listener task is aborted rather than joined. Connections it is
    /// still accepting after this returns are dropped without being
    /// reported. Closed connections still report `Disconnected` through the
    /// inbox.
    pub fn stop(&self) {
        let Some(task) = self.lock_listener().take() else {
            debug!("{}", constants::ERR_SERVER_INACTIVE);
            return;
        };
        let _timer = Timer::start("server_stop");
        info!("Server stopping");
        task.handle.abort();

        let connections: Vec<Arc<ConnectionState>> = {
            let mut table = self.shared.connections();
            task.run.cancel();
            table.drain().map(|(_, c)| c).collect()
        };
        for conn in &connections {
            conn.close();
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(closed = connections.len(), "Server stopped");
    }

    /// Queue a message for one connection
    ///
    /// Returns `false` for oversized messages, unknown ids, and connections
    /// whose send queue is full; the last case also closes the connection.
    pub fn send(&self, id: ConnectionId, bytes: &[u8]) -> bool {
        match self.try_send(id, bytes) {
            Ok(()) => true,
            Err(ProtocolError::QueueLimitExceeded(_)) => false,
            Err(e @ ProtocolError::UnknownConnection(_)) => {
                warn!(conn_id = id, error = %e, "Server send to unknown connection");
                false
            }
            Err(ProtocolError::OversizedPacket(len)) => {
                error!(
                    conn_id = id,
                    bytes = len,
                    max = self.shared.config.transport.max_message_size,
                    "{}",
                    constants::ERR_OVERSIZED_PACKET
                );
                false
            }
            Err(e) => {
                error!(conn_id = id, error = %e, bytes = bytes.len(), "Server send failed");
                false
            }
        }
    }

    fn try_send(&self, id: ConnectionId, bytes: &[u8]) -> Result<()> {
        let transport = &self.shared.config.transport;
        if bytes.len() > transport.max_message_size {
            return Err(ProtocolError::OversizedPacket(bytes.len()));
        }
        let conn = self
            .shared
            .connection(id)
            .ok_or(ProtocolError::UnknownConnection(id))?;
        conn.queue_send(bytes, transport.send_queue_limit, &self.shared.metrics)
    }

    /// Close one connection
    ///
    /// The connection leaves the table once its receive task has reported
    /// `Disconnected`.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.shared.connection(id) {
            Some(conn) => {
                info!(conn_id = id, "Disconnecting connection");
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Remote address of a connection, or an empty string if unknown
    pub fn client_address(&self, id: ConnectionId) -> String {
        self.shared
            .connection(id)
            .and_then(|c| c.peer_addr())
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    /// Deliver up to `max_messages` pending events to the callbacks
    ///
    /// Events are delivered in inbox order, which preserves each
    /// connection's own order. Stops early when `should_continue` returns
    /// `false`. Returns the number of events still queued.
    ///
    /// Only one `tick` runs at a time; a concurrent or nested call delivers
    /// nothing and returns the queue depth.
    pub fn tick(&self, max_messages: usize, should_continue: Option<&dyn Fn() -> bool>) -> usize {
        let inbox = &self.shared.inbox;

        let mut callbacks = match self.callbacks.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("Server tick already running on another thread or in a callback; ignoring");
                return inbox.count();
            }
        };

        let mut processed = 0;
        while processed < max_messages {
            if let Some(check) = should_continue {
                if !check() {
                    break;
                }
            }
            let Some(message) = inbox.try_peek() else {
                break;
            };

            match message.kind {
                EventKind::Connected => (callbacks.on_connected)(message.connection_id),
                EventKind::Data => (callbacks.on_data)(message.connection_id, message.bytes()),
                EventKind::Disconnected => (callbacks.on_disconnected)(message.connection_id),
            }
            drop(message);
            inbox.try_dequeue();
            processed += 1;
        }

        inbox.count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, run: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = run.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let id = match shared.next_connection_id() {
            Ok(id) => id,
            Err(e) => {
                // ids can no longer be unique; refuse to accept anything else
                error!(error = %e, "{}", constants::ERR_CONNECTION_ID_EXHAUSTED);
                return;
            }
        };

        let transport = &shared.config.transport;
        configure_socket(&stream, transport);
        info!(conn_id = id, peer = %peer, "Connection accepted");

        let conn = Arc::new(ConnectionState::accepted(
            id,
            transport.max_message_size,
            peer,
        ));
        if !shared.register(&run, &conn) {
            debug!(conn_id = id, "Server stopped; dropping accepted connection");
            return;
        }

        let (reader, writer) = stream.into_split();
        tokio::spawn(send_loop(
            writer,
            Arc::clone(&conn),
            transport.clone(),
            Arc::clone(&shared.metrics),
        ));

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            receive_loop(
                reader,
                &conn,
                &shared.inbox,
                &shared.config.transport,
                &shared.metrics,
            )
            .await;

            let mut connections = shared.connections();
            // a restarted server may already have stopped tracking it
            if connections
                .get(&id)
                .map(|c| Arc::ptr_eq(c, &conn))
                .unwrap_or(false)
            {
                connections.remove(&id);
            }
        });
    }
}
