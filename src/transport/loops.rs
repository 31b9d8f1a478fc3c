//! Receive and send tasks run once per connection.
//!
//! Both loops end only their own connection. Every failure, including a
//! panic inside the loop body, is caught here, logged, and turned into the
//! connection's terminal `Disconnected` event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::TransportConfig;
use crate::core::codec::FrameCodec;
use crate::core::message::{ConnectionId, EventKind};
use crate::error::{constants, ProtocolError, Result};
use crate::pipe::{Inbox, ReceivePipe};
use crate::transport::connection::{ConnectionPhase, ConnectionState};
use crate::utils::metrics::Metrics;

/// Destination for the events a receive loop produces
pub(crate) trait EventSink: Send + Sync {
    fn connected(&self, id: ConnectionId);
    fn data(&self, id: ConnectionId, bytes: &[u8]);
    fn disconnected(&self, id: ConnectionId);
    /// Events of `id` not yet drained by the consumer
    fn pending(&self, id: ConnectionId) -> usize;
}

impl EventSink for ReceivePipe {
    fn connected(&self, _id: ConnectionId) {
        self.set_connected();
    }

    fn data(&self, _id: ConnectionId, bytes: &[u8]) {
        self.enqueue(bytes);
    }

    fn disconnected(&self, _id: ConnectionId) {
        self.set_disconnected();
    }

    fn pending(&self, _id: ConnectionId) -> usize {
        self.count()
    }
}

impl EventSink for Inbox {
    fn connected(&self, id: ConnectionId) {
        self.enqueue(id, EventKind::Connected, None);
    }

    fn data(&self, id: ConnectionId, bytes: &[u8]) {
        self.enqueue(id, EventKind::Data, Some(bytes));
    }

    fn disconnected(&self, id: ConnectionId) {
        self.enqueue(id, EventKind::Disconnected, None);
    }

    fn pending(&self, id: ConnectionId) -> usize {
        self.count_for(id)
    }
}

/// Apply per-socket options from the configuration
pub(crate) fn configure_socket(stream: &TcpStream, config: &TransportConfig) {
    if let Err(e) = stream.set_nodelay(config.no_delay) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
}

/// Read frames until the socket closes, then report `Disconnected`
///
/// `Connected` is reported on entry and `Disconnected` is always the last
/// event this function produces for the connection.
#[instrument(skip_all, fields(conn_id = conn.id))]
pub(crate) async fn receive_loop<S: EventSink + ?Sized>(
    reader: OwnedReadHalf,
    conn: &ConnectionState,
    sink: &S,
    config: &TransportConfig,
    metrics: &Metrics,
) {
    conn.mark_connected();
    metrics.connection_established();
    sink.connected(conn.id);

    let outcome = AssertUnwindSafe(read_frames(reader, conn, sink, config, metrics))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => debug!("Connection closed"),
        Ok(Err(ProtocolError::OversizedPacket(len))) => {
            metrics.protocol_error();
            warn!(
                claimed = len,
                max = config.max_message_size,
                "Peer announced a message above the size limit; disconnecting"
            );
        }
        Ok(Err(e @ ProtocolError::QueueLimitExceeded(_))) => {
            metrics.queue_limit_disconnect();
            warn!(error = %e, "Consumer is not draining received messages; disconnecting");
        }
        // peer resets and timeouts are part of normal operation
        Ok(Err(e)) => info!(error = %e, "Connection ended"),
        Err(_) => error!("Receive loop panicked; connection ended"),
    }

    conn.close();
    conn.set_phase(ConnectionPhase::Closed);
    metrics.connection_closed();
    sink.disconnected(conn.id);
}

async fn read_frames<S: EventSink + ?Sized>(
    reader: OwnedReadHalf,
    conn: &ConnectionState,
    sink: &S,
    config: &TransportConfig,
    metrics: &Metrics,
) -> Result<()> {
    let mut frames = FramedRead::new(reader, FrameCodec::new(config.max_message_size));
    let receive_timeout = config.receive_timeout();

    loop {
        let next = tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => return Ok(()),
            next = next_frame(&mut frames, receive_timeout) => next?,
        };

        // zero-byte read: peer closed the stream
        let Some(frame) = next else {
            return Ok(());
        };

        if sink.pending(conn.id) >= config.receive_queue_limit {
            return Err(ProtocolError::QueueLimitExceeded(
                constants::ERR_RECEIVE_QUEUE_LIMIT,
            ));
        }

        trace!(bytes = frame.len(), "Received message");
        metrics.message_received(frame.len() as u64);
        sink.data(conn.id, &frame);
    }
}

async fn next_frame(
    frames: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    receive_timeout: Option<Duration>,
) -> Result<Option<BytesMut>> {
    let next = match receive_timeout {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| ProtocolError::Timeout(constants::ERR_RECEIVE_TIMEOUT))?,
        None => frames.next().await,
    };
    next.transpose()
}

/// Write batches from the send pipe until the connection is closed
///
/// Every wakeup drains the whole pipe into one buffer and writes it with a
/// single call.
#[instrument(skip_all, fields(conn_id = conn.id))]
pub(crate) async fn send_loop(
    writer: OwnedWriteHalf,
    conn: Arc<ConnectionState>,
    config: TransportConfig,
    metrics: Arc<Metrics>,
) {
    let outcome = AssertUnwindSafe(write_batches(writer, &conn, &config, &metrics))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => debug!("Send loop stopped"),
        Ok(Err(e)) => info!(error = %e, "Send failed; connection ended"),
        Err(_) => error!("Send loop panicked; connection ended"),
    }

    // the receive loop notices and reports Disconnected
    conn.close();
}

async fn write_batches(
    mut writer: OwnedWriteHalf,
    conn: &ConnectionState,
    config: &TransportConfig,
    metrics: &Metrics,
) -> Result<()> {
    let mut batch = BytesMut::with_capacity(config.max_message_size);
    let send_timeout = config.send_timeout();

    loop {
        // Register for the wake signal before looking at the queue, so a
        // send that lands between the check and the wait is not lost.
        let notified = conn.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match conn.send_pipe.dequeue_and_serialize_all(&mut batch) {
            Some(size) => {
                tokio::select! {
                    biased;
                    _ = conn.shutdown.cancelled() => return Ok(()),
                    written = write_all(&mut writer, &batch, send_timeout) => written?,
                }
                trace!(bytes = size, "Wrote batch");
                metrics.write_batch();
            }
            None => {
                tokio::select! {
                    _ = conn.shutdown.cancelled() => return Ok(()),
                    _ = &mut notified => {}
                }
            }
        }
    }
}

async fn write_all(
    writer: &mut OwnedWriteHalf,
    batch: &[u8],
    send_timeout: Option<Duration>,
) -> Result<()> {
    match send_timeout {
        Some(limit) => tokio::time::timeout(limit, writer.write_all(batch))
            .await
            .map_err(|_| ProtocolError::Timeout(constants::ERR_SEND_TIMEOUT))??,
        None => writer.write_all(batch).await?,
    }
    Ok(())
}
