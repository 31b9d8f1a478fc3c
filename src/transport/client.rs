//! # Client
//!
//! Manages exactly one outgoing connection.
//!
//! `connect` returns immediately; the connect, send and receive work happens
//! on background tasks. The application drains received events by calling
//! [`Client::tick`] on its own schedule, which invokes the registered
//! callbacks on the calling thread.
//!
//! ```rust,no_run
//! use msgpipe::config::ClientConfig;
//! use msgpipe::transport::client::Client;
//!
//! let client = Client::new(ClientConfig::default()).unwrap();
//! client.on_data(|bytes| println!("received {} bytes", bytes.len()));
//! client.connect("127.0.0.1", 7777);
//!
//! loop {
//!     client.tick(100, None);
//!     if client.connected() {
//!         client.send(b"hello");
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::message::ConnectionId;
use crate::error::{constants, ProtocolError, Result};
use crate::pipe::ReceivePipe;
use crate::transport::connection::{ConnectionPhase, ConnectionState};
use crate::transport::loops::{configure_socket, receive_loop, send_loop};
use crate::transport::runtime::TransportRuntime;
use crate::utils::metrics::Metrics;

/// Connection id carried by every client-side event
pub const CLIENT_CONNECTION_ID: ConnectionId = 0;

type ConnectedFn = Box<dyn FnMut() + Send>;
type DataFn = Box<dyn FnMut(&[u8]) + Send>;
type DisconnectedFn = Box<dyn FnMut() + Send>;

struct ClientCallbacks {
    on_connected: ConnectedFn,
    on_data: DataFn,
    on_disconnected: DisconnectedFn,
}

impl Default for ClientCallbacks {
    fn default() -> Self {
        Self {
            on_connected: Box::new(|| {}),
            on_data: Box::new(|_| {}),
            on_disconnected: Box::new(|| {}),
        }
    }
}

/// Everything belonging to one connect attempt
///
/// A new one is allocated on every `connect`, so tasks of an earlier attempt
/// that are still winding down can only ever touch their own state.
struct ClientConnection {
    conn: Arc<ConnectionState>,
    receive_pipe: Arc<ReceivePipe>,
}

/// Single-connection message client
pub struct Client {
    config: ClientConfig,
    runtime: TransportRuntime,
    current: Mutex<Option<Arc<ClientConnection>>>,
    callbacks: Mutex<ClientCallbacks>,
    metrics: Arc<Metrics>,
}

impl Client {
    /// Create a client with its own background runtime
    ///
    /// Fails with `ConfigError` if `config` does not validate.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate_strict()?;
        let runtime = TransportRuntime::dedicated("msgpipe-client", Some(2))?;
        Ok(Self::build(config, runtime))
    }

    /// Create a client whose tasks run on an existing runtime
    pub fn with_runtime(config: ClientConfig, handle: Handle) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self::build(config, TransportRuntime::shared(handle)))
    }

    fn build(config: ClientConfig, runtime: TransportRuntime) -> Self {
        Self {
            config,
            runtime,
            current: Mutex::new(None),
            callbacks: Mutex::new(ClientCallbacks::default()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Called once when the connection is established
    ///
    /// The callback setters must not be called from inside a callback: the
    /// callbacks are locked for the whole of [`Client::tick`], so doing so
    /// deadlocks.
    pub fn on_connected<F: FnMut() + Send + 'static>(&self, f: F) {
        self.lock_callbacks().on_connected = Box::new(f);
    }

    /// Called for every received message
    pub fn on_data<F: FnMut(&[u8]) + Send + 'static>(&self, f: F) {
        self.lock_callbacks().on_data = Box::new(f);
    }

    /// Called once when the connection ends or could not be established
    pub fn on_disconnected<F: FnMut() + Send + 'static>(&self, f: F) {
        self.lock_callbacks().on_disconnected = Box::new(f);
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, ClientCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<ClientConnection>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Whether a connect attempt is in progress
    pub fn connecting(&self) -> bool {
        self.current()
            .map(|c| c.conn.is_connecting())
            .unwrap_or(false)
    }

    /// Whether the connection is established
    pub fn connected(&self) -> bool {
        self.current()
            .map(|c| c.conn.is_connected())
            .unwrap_or(false)
    }

    /// Messages waiting to be written to the socket
    pub fn send_pipe_count(&self) -> usize {
        self.current()
            .map(|c| c.conn.send_pipe.count())
            .unwrap_or(0)
    }

    /// Messages waiting to be drained by [`Client::tick`]
    pub fn receive_pipe_count(&self) -> usize {
        self.current()
            .map(|c| c.receive_pipe.count())
            .unwrap_or(0)
    }

    /// Start connecting to `host:port` in the background
    ///
    /// Does nothing (besides a warning) while already connecting or
    /// connected. A failed attempt is reported through `on_disconnected`.
    pub fn connect(&self, host: &str, port: u16) {
        let mut slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            if existing.conn.is_connecting() || existing.conn.is_connected() {
                warn!(host, port, "{}", constants::ERR_ALREADY_CONNECTING);
                return;
            }
        }

        let transport = &self.config.transport;
        let attempt = Arc::new(ClientConnection {
            conn: Arc::new(ConnectionState::connecting(
                CLIENT_CONNECTION_ID,
                transport.max_message_size,
            )),
            receive_pipe: Arc::new(ReceivePipe::new(transport.max_message_size)),
        });
        *slot = Some(Arc::clone(&attempt));
        drop(slot);

        info!(host, port, "Connecting");
        self.runtime.spawn(run_connection(
            host.to_string(),
            port,
            attempt,
            self.config.clone(),
            Arc::clone(&self.metrics),
        ));
    }

    /// Close the connection or abort the connect attempt
    ///
    /// Queued outgoing messages are dropped. Already received messages and
    /// the final `Disconnected` event stay deliverable through `tick`.
    pub fn disconnect(&self) {
        let Some(current) = self.current() else {
            return;
        };
        if current.conn.is_connecting() || current.conn.is_connected() {
            info!("Disconnecting");
            current.conn.close();
            current.conn.send_pipe.clear();
        }
    }

    /// Queue a message for sending
    ///
    /// Returns `false` when not connected, when the message is larger than
    /// the configured maximum, or when the send queue is full. The last case
    /// also closes the connection.
    pub fn send(&self, bytes: &[u8]) -> bool {
        match self.try_send(bytes) {
            Ok(()) => true,
            Err(ProtocolError::QueueLimitExceeded(_)) => false,
            Err(ProtocolError::NotConnected) => {
                warn!(bytes = bytes.len(), "{}", constants::ERR_NOT_CONNECTED);
                false
            }
            Err(ProtocolError::ConnectionClosed) => {
                debug!(bytes = bytes.len(), "{}", constants::ERR_CONNECTION_CLOSED);
                false
            }
            Err(ProtocolError::OversizedPacket(len)) => {
                error!(
                    bytes = len,
                    max = self.config.transport.max_message_size,
                    "{}",
                    constants::ERR_OVERSIZED_PACKET
                );
                false
            }
            Err(e) => {
                error!(error = %e, bytes = bytes.len(), "Client send failed");
                false
            }
        }
    }

    fn try_send(&self, bytes: &[u8]) -> Result<()> {
        let current = self.current().ok_or(ProtocolError::NotConnected)?;
        match current.conn.phase() {
            ConnectionPhase::Connected => {}
            ConnectionPhase::Connecting => return Err(ProtocolError::NotConnected),
            ConnectionPhase::Disconnecting | ConnectionPhase::Closed => {
                return Err(ProtocolError::ConnectionClosed)
            }
        }

        let transport = &self.config.transport;
        if bytes.len() > transport.max_message_size {
            return Err(ProtocolError::OversizedPacket(bytes.len()));
        }

        current
            .conn
            .queue_send(bytes, transport.send_queue_limit, &self.metrics)
    }

    /// Deliver up to `max_messages` pending events to the callbacks
    ///
    /// `on_connected` counts toward the budget. Data is delivered in arrival
    /// order until the budget is spent, the queue is empty, or
    /// `should_continue` returns `false`. `on_disconnected` fires once all
    /// data of the connection has been delivered. Returns the number of
    /// messages still queued.
    ///
    /// Only one `tick` runs at a time. A call made while another is in
    /// progress, on another thread or from inside a callback, delivers
    /// nothing and just returns the queue depth.
    pub fn tick(&self, max_messages: usize, should_continue: Option<&dyn Fn() -> bool>) -> usize {
        let Some(current) = self.current() else {
            return 0;
        };
        let pipe = &current.receive_pipe;

        let mut callbacks = match self.callbacks.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("Client tick already running on another thread or in a callback; ignoring");
                return pipe.count();
            }
        };

        let mut processed = 0;
        if pipe.check_connected() {
            (callbacks.on_connected)();
            processed += 1;
        }

        while processed < max_messages {
            if let Some(check) = should_continue {
                if !check() {
                    break;
                }
            }
            let Some(segment) = pipe.try_peek() else {
                break;
            };
            (callbacks.on_data)(&segment[..]);
            drop(segment);
            pipe.try_dequeue();
            processed += 1;
        }

        // Disconnected is latched after the last message was enqueued, so
        // once it is visible and the queue is empty nothing can follow it.
        if pipe.disconnect_pending() && pipe.count() == 0 && pipe.check_disconnected() {
            (callbacks.on_disconnected)();
        }

        pipe.count()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Background task of one connect attempt
#[instrument(skip_all, fields(host = %host, port = port))]
async fn run_connection(
    host: String,
    port: u16,
    attempt: Arc<ClientConnection>,
    config: ClientConfig,
    metrics: Arc<Metrics>,
) {
    let conn = Arc::clone(&attempt.conn);

    let stream = tokio::select! {
        biased;
        _ = conn.shutdown.cancelled() => None,
        result = open_stream(&host, port, &config) => match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                info!(error = %e, "Failed to connect");
                None
            }
        },
    };

    let Some(stream) = stream else {
        metrics.connect_failed();
        conn.set_phase(ConnectionPhase::Closed);
        attempt.receive_pipe.set_disconnected();
        return;
    };

    configure_socket(&stream, &config.transport);
    debug!(peer = ?stream.peer_addr().ok(), "Connected");

    let (reader, writer) = stream.into_split();
    tokio::spawn(send_loop(
        writer,
        Arc::clone(&conn),
        config.transport.clone(),
        Arc::clone(&metrics),
    ));
    receive_loop(
        reader,
        &conn,
        attempt.receive_pipe.as_ref(),
        &config.transport,
        &metrics,
    )
    .await;
}

async fn open_stream(host: &str, port: u16, config: &ClientConfig) -> Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    let stream = match config.connect_timeout() {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| ProtocolError::Timeout(constants::ERR_CONNECT_TIMEOUT))??,
        None => connect.await?,
    };
    Ok(stream)
}
