//! Per-connection state shared between the send task, the receive task and
//! the owning `Client`/`Server`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::message::ConnectionId;
use crate::error::{constants, ProtocolError, Result};
use crate::pipe::SendPipe;
use crate::utils::metrics::Metrics;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionPhase {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Closed = 3,
}

impl ConnectionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionPhase::Connecting,
            1 => ConnectionPhase::Connected,
            2 => ConnectionPhase::Disconnecting,
            _ => ConnectionPhase::Closed,
        }
    }
}

/// Socket-side state of one connection
///
/// The socket halves themselves are owned by the send and receive tasks;
/// closing the connection means cancelling `shutdown`, which makes both tasks
/// drop their half.
pub struct ConnectionState {
    pub(crate) id: ConnectionId,
    pub(crate) send_pipe: SendPipe,
    pub(crate) wake: Notify,
    pub(crate) shutdown: CancellationToken,
    phase: AtomicU8,
    peer: Option<SocketAddr>,
}

impl ConnectionState {
    /// State for an outgoing connection that has not connected yet
    pub(crate) fn connecting(id: ConnectionId, max_message_size: usize) -> Self {
        Self::with_phase(id, max_message_size, ConnectionPhase::Connecting, None)
    }

    /// State for a socket returned by `accept`
    pub(crate) fn accepted(id: ConnectionId, max_message_size: usize, peer: SocketAddr) -> Self {
        Self::with_phase(id, max_message_size, ConnectionPhase::Connected, Some(peer))
    }

    fn with_phase(
        id: ConnectionId,
        max_message_size: usize,
        phase: ConnectionPhase,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            id,
            send_pipe: SendPipe::new(max_message_size),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            phase: AtomicU8::new(phase as u8),
            peer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: ConnectionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Move from `Connecting` to `Connected` unless a close was requested
    pub(crate) fn mark_connected(&self) {
        let _ = self.phase.compare_exchange(
            ConnectionPhase::Connecting as u8,
            ConnectionPhase::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_connecting(&self) -> bool {
        self.phase() == ConnectionPhase::Connecting
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Ask both connection tasks to drop the socket
    ///
    /// Idempotent. The receive task reports `Disconnected` once it has
    /// observed the request.
    pub(crate) fn close(&self) {
        let _ = self.phase.compare_exchange(
            ConnectionPhase::Connecting as u8,
            ConnectionPhase::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.phase.compare_exchange(
            ConnectionPhase::Connected as u8,
            ConnectionPhase::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if !self.shutdown.is_cancelled() {
            debug!(conn_id = self.id, "Closing connection");
            self.shutdown.cancel();
        }
    }

    /// Queue one message for the send task and wake it
    ///
    /// A connection whose queue already holds `queue_limit` messages is not
    /// draining fast enough; it is closed instead of growing without bound.
    pub(crate) fn queue_send(&self, bytes: &[u8], queue_limit: usize, metrics: &Metrics) -> Result<()> {
        let pending = self.send_pipe.count();
        if pending >= queue_limit {
            warn!(
                conn_id = self.id,
                pending,
                limit = queue_limit,
                "Send queue limit reached, peer is not keeping up; disconnecting"
            );
            metrics.queue_limit_disconnect();
            self.close();
            return Err(ProtocolError::QueueLimitExceeded(constants::ERR_SEND_QUEUE_LIMIT));
        }

        self.send_pipe.enqueue(bytes);
        self.wake.notify_one();
        metrics.message_sent(bytes.len() as u64);
        Ok(())
    }
}
